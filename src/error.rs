//! Error types.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::publication::ReferenceId;

/// Errors returned by the registry itself.
///
/// Failures of a producer are not `CacheError`s: they are cached inside the
/// [`ComputedValue`](crate::ComputedValue) as a [`ProductionError`].
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// A computation (transitively) read itself.
    ///
    /// The `path` contains a debug representation of the fingerprints forming the cycle.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Debug representation of the fingerprints forming the cycle.
        path: Vec<String>,
    },

    /// The caller stopped waiting for an in-flight production.
    ///
    /// The production itself keeps running for the remaining waiters.
    #[error("stopped waiting for in-flight production of {fingerprint}")]
    Cancelled {
        /// Debug representation of the fingerprint.
        fingerprint: String,
    },

    /// The slot holds an output of a different type.
    ///
    /// Two logically distinct operations share a fingerprint.
    #[error("cached output of {fingerprint} is not a `{expected}`")]
    OutputTypeMismatch {
        /// Debug representation of the fingerprint.
        fingerprint: String,
        /// Type name the caller asked for.
        expected: &'static str,
    },
}

/// A producer failure, cached and replayed like a successful value.
///
/// Every reader of the slot observes the same failure until the slot is invalidated.
#[derive(Clone)]
pub struct ProductionError(Arc<anyhow::Error>);

impl ProductionError {
    pub(crate) fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    /// Attempts to downcast the failure to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    /// Returns `true` if the failure is an error of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }

    /// Like [`downcast_ref`](Self::downcast_ref), but also looks through failures
    /// of dependencies that were propagated with `?`.
    pub fn find<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        match self.0.downcast_ref::<E>() {
            Some(err) => Some(err),
            None => self
                .0
                .downcast_ref::<ProductionError>()
                .and_then(|nested| nested.find::<E>()),
        }
    }

    /// Returns `true` if both handles share the same cached failure.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ProductionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for ProductionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for ProductionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + Send + Sync + 'static) = (*self.0).as_ref();
        Some(inner)
    }
}

/// Errors of the remote consistency protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublicationError {
    /// The metadata channel of this exchange already carries a publication.
    #[error("publication conflict: this exchange already published {existing}")]
    Conflict {
        /// Reference already attached to the channel.
        existing: ReferenceId,
    },

    /// The value was produced by another registry, or has been evicted.
    #[error("value {reference} is not held by this registry")]
    ForeignValue {
        /// Reference of the rejected value.
        reference: ReferenceId,
    },

    /// A required header is absent.
    #[error("missing publication header `{header}`")]
    MissingHeader {
        /// Header name.
        header: &'static str,
    },

    /// A header is present but cannot be parsed.
    #[error("malformed publication header `{header}`: {value:?}")]
    MalformedHeader {
        /// Header name.
        header: &'static str,
        /// Raw header value.
        value: String,
    },
}
