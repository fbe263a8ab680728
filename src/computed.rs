use std::fmt;
use std::sync::Arc;

use crate::arena::NodeId;
use crate::error::{CacheError, ProductionError};
use crate::fingerprint::Fingerprint;
use crate::node::{CachedOutput, Node};
use crate::version::{Consistency, Version};

/// Handle to one cached result.
///
/// The value and version of a handle never change; consistency is read live,
/// so a handle obtained before an invalidation observes it. Handles are cheap
/// to clone and each live handle counts as an active reader of its node, which
/// keeps the node from being evicted.
pub struct ComputedValue<T> {
    node: Arc<Node>,
    output: Result<Arc<T>, ProductionError>,
}

impl<T: Send + Sync + 'static> ComputedValue<T> {
    pub(crate) fn from_node(node: Arc<Node>) -> Result<Self, CacheError> {
        let output = match node.output() {
            CachedOutput::Value(value) => match value.clone().downcast::<T>() {
                Ok(value) => Ok(value),
                Err(_) => {
                    return Err(CacheError::OutputTypeMismatch {
                        fingerprint: node.fingerprint().debug_repr(),
                        expected: std::any::type_name::<T>(),
                    })
                }
            },
            CachedOutput::Failed(err) => Err(err.clone()),
        };
        node.acquire_reader();
        Ok(Self { node, output })
    }
}

impl<T> ComputedValue<T> {
    /// Fingerprint of the slot this value was produced for.
    pub fn fingerprint(&self) -> &Fingerprint {
        self.node.fingerprint()
    }

    /// Version within the slot lineage.
    pub fn version(&self) -> Version {
        self.node.version()
    }

    /// Current consistency of this value.
    pub fn consistency(&self) -> Consistency {
        self.node.consistency()
    }

    /// Returns true while nothing this value read has been invalidated.
    pub fn is_consistent(&self) -> bool {
        self.node.is_consistent()
    }

    /// The produced value, or the cached failure.
    pub fn value(&self) -> Result<&T, &ProductionError> {
        self.output.as_deref()
    }

    /// Shared ownership of the produced value, or the cached failure.
    pub fn output(&self) -> Result<Arc<T>, ProductionError> {
        self.output.clone()
    }

    /// Returns true if the producer failed.
    pub fn is_failed(&self) -> bool {
        self.output.is_err()
    }

    /// Number of distinct values read while producing this one.
    pub fn dependency_count(&self) -> usize {
        self.node.dependencies().len()
    }

    /// Arena id of the underlying node.
    pub fn node_id(&self) -> NodeId {
        self.node.id()
    }

    /// Returns true if both handles refer to the same produced instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    pub(crate) fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl<T> Clone for ComputedValue<T> {
    fn clone(&self) -> Self {
        self.node.acquire_reader();
        Self {
            node: self.node.clone(),
            output: self.output.clone(),
        }
    }
}

impl<T> Drop for ComputedValue<T> {
    fn drop(&mut self) {
        self.node.release_reader();
    }
}

impl<T: fmt::Debug> fmt::Debug for ComputedValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedValue")
            .field("fingerprint", self.fingerprint())
            .field("version", &self.version())
            .field("consistency", &self.consistency())
            .field("output", &self.output)
            .finish()
    }
}
