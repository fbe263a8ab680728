//! Generation-checked arena that owns every live node of the dependency graph.
//!
//! Graph edges store [`NodeId`]s instead of references. Evicting a node
//! tombstones its slot; a later lookup through a stale edge sees a generation
//! mismatch and treats the node as gone.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use slab::Slab;

use crate::node::Node;

/// Generations are drawn from one counter for the whole process, so ids from
/// two registries never coincide.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Index of a node in the arena, checked against the slot's generation on every lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u64,
}

impl NodeId {
    pub(crate) fn from_parts(index: u32, generation: u64) -> Self {
        Self { index, generation }
    }

    /// Slot index. Reused after the node is evicted.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation. Never reused within the process.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Entry {
    generation: u64,
    node: Arc<Node>,
}

pub(crate) struct Arena {
    entries: RwLock<Slab<Entry>>,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Slab::new()),
        }
    }

    /// Allocate a slot and build the node that lives in it.
    pub fn insert(&self, build: impl FnOnce(NodeId) -> Node) -> Arc<Node> {
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        let vacant = entries.vacant_entry();
        let id = NodeId::from_parts(vacant.key() as u32, generation);
        let node = Arc::new(build(id));
        vacant.insert(Entry {
            generation,
            node: node.clone(),
        });
        node
    }

    /// Resolve an id. Returns `None` if the node was evicted.
    pub fn get(&self, id: NodeId) -> Option<Arc<Node>> {
        let entries = self.entries.read();
        entries
            .get(id.index as usize)
            .filter(|entry| entry.generation == id.generation)
            .map(|entry| entry.node.clone())
    }

    /// Returns true if the id still resolves.
    pub fn contains(&self, id: NodeId) -> bool {
        let entries = self.entries.read();
        entries
            .get(id.index as usize)
            .is_some_and(|entry| entry.generation == id.generation)
    }

    /// Tombstone a slot. Returns the node if the id was still live.
    pub fn remove(&self, id: NodeId) -> Option<Arc<Node>> {
        let mut entries = self.entries.write();
        let live = entries
            .get(id.index as usize)
            .is_some_and(|entry| entry.generation == id.generation);
        if live {
            Some(entries.remove(id.index as usize).node)
        } else {
            None
        }
    }

    /// Snapshot of every live node.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let entries = self.entries.read();
        entries.iter().map(|(_, entry)| entry.node.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}
