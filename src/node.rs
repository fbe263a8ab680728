use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::NodeId;
use crate::error::ProductionError;
use crate::fingerprint::Fingerprint;
use crate::version::{Consistency, ConsistencyFlag, Version};

/// Type-erased result of one production run.
#[derive(Clone)]
pub(crate) enum CachedOutput {
    Value(Arc<dyn Any + Send + Sync>),
    Failed(ProductionError),
}

/// Ids of the nodes read while this node was produced. Fixed at production time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Dependencies(Arc<[NodeId]>);

impl Dependencies {
    /// Build from recorded reads, dropping duplicates.
    pub fn from_reads(mut reads: Vec<NodeId>) -> Self {
        reads.sort_unstable();
        reads.dedup();
        Dependencies(reads.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.0.iter().copied()
    }
}

/// One produced value together with its graph bookkeeping.
///
/// Nothing about a node changes after construction except the consistency flag,
/// the dependents index and the access bookkeeping. A new value is always a new node.
pub(crate) struct Node {
    id: NodeId,
    fingerprint: Fingerprint,
    version: Version,
    consistency: ConsistencyFlag,
    dependencies: Dependencies,
    dependents: Mutex<Vec<NodeId>>,
    output: CachedOutput,
    /// Number of live `ComputedValue` handles.
    readers: AtomicUsize,
    /// Milliseconds since the registry epoch.
    last_read: AtomicU64,
    /// Set once the node no longer occupies its registry slot.
    superseded: AtomicBool,
}

impl Node {
    pub fn new(
        id: NodeId,
        fingerprint: Fingerprint,
        version: Version,
        dependencies: Dependencies,
        output: CachedOutput,
        now: u64,
    ) -> Self {
        Self {
            id,
            fingerprint,
            version,
            consistency: ConsistencyFlag::new(),
            dependencies,
            dependents: Mutex::new(Vec::new()),
            output,
            readers: AtomicUsize::new(0),
            last_read: AtomicU64::new(now),
            superseded: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency.get()
    }

    pub fn is_consistent(&self) -> bool {
        self.consistency() == Consistency::Consistent
    }

    /// Flip to `Invalidated`. Returns true only for the caller that performed the flip.
    pub fn mark_invalidated(&self) -> bool {
        self.consistency.invalidate()
    }

    pub fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }

    pub fn output(&self) -> &CachedOutput {
        &self.output
    }

    /// Register `dependent` in the reverse index.
    pub fn add_dependent(&self, dependent: NodeId) {
        let mut dependents = self.dependents.lock();
        if !dependents.contains(&dependent) {
            dependents.push(dependent);
        }
    }

    /// Copy of the reverse index, taken under the edge lock.
    pub fn dependents(&self) -> Vec<NodeId> {
        self.dependents.lock().clone()
    }

    /// Drop reverse edges for which `is_live` returns false. Returns the number dropped.
    pub fn retain_dependents(&self, mut is_live: impl FnMut(NodeId) -> bool) -> usize {
        let mut dependents = self.dependents.lock();
        let before = dependents.len();
        dependents.retain(|id| is_live(*id));
        before - dependents.len()
    }

    pub fn acquire_reader(&self) {
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release_reader(&self) {
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    pub fn touch(&self, now: u64) {
        self.last_read.fetch_max(now, Ordering::Relaxed);
    }

    pub fn last_read(&self) -> u64 {
        self.last_read.load(Ordering::Relaxed)
    }

    pub fn mark_superseded(&self) {
        self.superseded.store(true, Ordering::Release);
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint)
            .field("version", &self.version)
            .field("consistency", &self.consistency())
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}
