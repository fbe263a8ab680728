//! Tracer trait for observing cache activity.
//!
//! The default [`NoopTracer`] discards every event. With the `tracing` feature,
//! [`TracingTracer`] forwards events to the `tracing` crate as structured records.
//!
//! # Example
//!
//! ```
//! use memo_flow::{Fingerprint, Registry, SpanId, Tracer};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! #[derive(Default)]
//! struct CountingTracer {
//!     productions: AtomicUsize,
//! }
//!
//! impl Tracer for CountingTracer {
//!     fn new_span_id(&self) -> SpanId {
//!         SpanId(0)
//!     }
//!
//!     fn on_production_start(&self, _span_id: SpanId, _fingerprint: &Fingerprint) {
//!         self.productions.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//!
//! let tracer = Arc::new(CountingTracer::default());
//! let registry = Registry::builder().tracer(tracer.clone()).build();
//! registry.get_or_compute(Fingerprint::new("one", ()), |_| Ok(1)).unwrap();
//! assert_eq!(tracer.productions.load(Ordering::Relaxed), 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::invalidation::InvalidationReason;
use crate::publication::PublicationHandle;
use crate::version::Version;

/// Unique identifier for a production span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(pub u64);

/// How a production run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductionOutcome {
    /// The producer returned a value.
    Succeeded,
    /// The producer returned an error, which is now cached.
    Failed {
        /// Display form of the error.
        message: String,
    },
}

/// Why a node left the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCause {
    /// Idle for longer than the keep-alive window.
    KeepAliveExpired,
    /// Replaced in its slot and no longer read.
    Superseded,
    /// Removed explicitly.
    Removed,
}

/// Tracer trait for observing cache activity.
///
/// All methods except [`Tracer::new_span_id`] have empty default implementations.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; hooks are called from whichever
/// thread performs the operation.
pub trait Tracer: Send + Sync + 'static {
    /// Generate a new unique span ID. Called at the start of each production.
    fn new_span_id(&self) -> SpanId;

    /// A Consistent value was returned without production.
    #[inline]
    fn on_cache_hit(&self, _fingerprint: &Fingerprint, _version: Version) {}

    /// A caller started waiting for another caller's production.
    #[inline]
    fn on_wait(&self, _fingerprint: &Fingerprint) {}

    /// A production run started.
    #[inline]
    fn on_production_start(&self, _span_id: SpanId, _fingerprint: &Fingerprint) {}

    /// A production run finished and its node was installed.
    #[inline]
    fn on_production_end(
        &self,
        _span_id: SpanId,
        _fingerprint: &Fingerprint,
        _version: Version,
        _outcome: ProductionOutcome,
    ) {
    }

    /// A read was recorded into the capture frame of `parent`.
    #[inline]
    fn on_dependency_recorded(&self, _parent: &Fingerprint, _dependency: &Fingerprint) {}

    /// A read would have re-entered an active production.
    #[inline]
    fn on_cycle_detected(&self, _path: &[String]) {}

    /// A node flipped from Consistent to Invalidated.
    #[inline]
    fn on_invalidated(
        &self,
        _fingerprint: &Fingerprint,
        _version: Version,
        _reason: &InvalidationReason,
    ) {
    }

    /// A node was tombstoned.
    #[inline]
    fn on_evicted(&self, _fingerprint: &Fingerprint, _version: Version, _cause: EvictionCause) {}

    /// A value was published for remote observation.
    #[inline]
    fn on_published(&self, _fingerprint: &Fingerprint, _handle: &PublicationHandle) {}
}

impl<T: Tracer + ?Sized> Tracer for Arc<T> {
    fn new_span_id(&self) -> SpanId {
        (**self).new_span_id()
    }

    fn on_cache_hit(&self, fingerprint: &Fingerprint, version: Version) {
        (**self).on_cache_hit(fingerprint, version)
    }

    fn on_wait(&self, fingerprint: &Fingerprint) {
        (**self).on_wait(fingerprint)
    }

    fn on_production_start(&self, span_id: SpanId, fingerprint: &Fingerprint) {
        (**self).on_production_start(span_id, fingerprint)
    }

    fn on_production_end(
        &self,
        span_id: SpanId,
        fingerprint: &Fingerprint,
        version: Version,
        outcome: ProductionOutcome,
    ) {
        (**self).on_production_end(span_id, fingerprint, version, outcome)
    }

    fn on_dependency_recorded(&self, parent: &Fingerprint, dependency: &Fingerprint) {
        (**self).on_dependency_recorded(parent, dependency)
    }

    fn on_cycle_detected(&self, path: &[String]) {
        (**self).on_cycle_detected(path)
    }

    fn on_invalidated(
        &self,
        fingerprint: &Fingerprint,
        version: Version,
        reason: &InvalidationReason,
    ) {
        (**self).on_invalidated(fingerprint, version, reason)
    }

    fn on_evicted(&self, fingerprint: &Fingerprint, version: Version, cause: EvictionCause) {
        (**self).on_evicted(fingerprint, version, cause)
    }

    fn on_published(&self, fingerprint: &Fingerprint, handle: &PublicationHandle) {
        (**self).on_published(fingerprint, handle)
    }
}

/// Global span counter shared by the built-in tracers.
static SPAN_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_span_id() -> SpanId {
    SpanId(SPAN_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`Registry`](crate::Registry).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    #[inline(always)]
    fn new_span_id(&self) -> SpanId {
        next_span_id()
    }
}

/// Tracer that forwards events to the `tracing` crate.
///
/// State changes are emitted at `DEBUG`, hits and dependency edges at `TRACE`,
/// cycles at `WARN`.
#[cfg(feature = "tracing")]
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTracer;

#[cfg(feature = "tracing")]
impl Tracer for TracingTracer {
    fn new_span_id(&self) -> SpanId {
        next_span_id()
    }

    fn on_cache_hit(&self, fingerprint: &Fingerprint, version: Version) {
        tracing::trace!(fingerprint = %fingerprint, version = version.0, "cache hit");
    }

    fn on_wait(&self, fingerprint: &Fingerprint) {
        tracing::trace!(fingerprint = %fingerprint, "wait on in-flight production");
    }

    fn on_production_start(&self, span_id: SpanId, fingerprint: &Fingerprint) {
        tracing::debug!(span = span_id.0, fingerprint = %fingerprint, "produce: start");
    }

    fn on_production_end(
        &self,
        span_id: SpanId,
        fingerprint: &Fingerprint,
        version: Version,
        outcome: ProductionOutcome,
    ) {
        match outcome {
            ProductionOutcome::Succeeded => tracing::debug!(
                span = span_id.0,
                fingerprint = %fingerprint,
                version = version.0,
                "produce: ok"
            ),
            ProductionOutcome::Failed { message } => tracing::debug!(
                span = span_id.0,
                fingerprint = %fingerprint,
                version = version.0,
                error = %message,
                "produce: failed"
            ),
        }
    }

    fn on_dependency_recorded(&self, parent: &Fingerprint, dependency: &Fingerprint) {
        tracing::trace!(parent = %parent, dependency = %dependency, "dependency recorded");
    }

    fn on_cycle_detected(&self, path: &[String]) {
        tracing::warn!(path = %path.join(" -> "), "dependency cycle detected");
    }

    fn on_invalidated(
        &self,
        fingerprint: &Fingerprint,
        version: Version,
        reason: &InvalidationReason,
    ) {
        tracing::debug!(
            fingerprint = %fingerprint,
            version = version.0,
            reason = ?reason,
            "invalidated"
        );
    }

    fn on_evicted(&self, fingerprint: &Fingerprint, version: Version, cause: EvictionCause) {
        tracing::debug!(
            fingerprint = %fingerprint,
            version = version.0,
            cause = ?cause,
            "evicted"
        );
    }

    fn on_published(&self, fingerprint: &Fingerprint, handle: &PublicationHandle) {
        tracing::debug!(
            fingerprint = %fingerprint,
            reference = %handle.reference_id,
            version = handle.version.0,
            consistency = %handle.consistency,
            "published"
        );
    }
}
