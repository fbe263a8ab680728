#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod arena;
mod capture;
mod computed;
mod config;
mod error;
mod eviction;
mod fingerprint;
mod invalidation;
mod node;
mod publication;
mod reader;
mod registry;
mod tracer;
mod version;

pub use arena::NodeId;
pub use capture::ComputeContext;
pub use computed::ComputedValue;
pub use config::{CacheConfig, RegistryBuilder};
pub use error::{CacheError, ProductionError, PublicationError};
pub use eviction::EvictionReport;
pub use fingerprint::{CacheKey, DynEq, Fingerprint, OperationKey, TagKey};
pub use invalidation::{InvalidationReason, InvalidationReport};
pub use publication::{
    publication_requested, ConsistencyReport, MetadataSink, ParseReferenceIdError,
    PublicationHandle, ReferenceId, ResponseMetadata, CONSISTENCY_HEADER,
    PUBLISH_REQUEST_HEADER, REFERENCE_HEADER, VERSION_HEADER,
};
pub use reader::{Reader, Tracked};
pub use registry::Registry;
#[cfg(feature = "tracing")]
pub use tracer::TracingTracer;
pub use tracer::{EvictionCause, NoopTracer, ProductionOutcome, SpanId, Tracer};
pub use version::{Consistency, Version};
