//! Keep-alive based eviction.
//!
//! A node is evictable once nobody holds a handle to it, it has not been read
//! for the keep-alive window, and no Consistent dependent still relies on it.
//! Evicting tombstones the node: its arena entry is removed, so dependents
//! linking to it or invalidations walking through it simply find nothing.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::fingerprint::Fingerprint;
use crate::invalidation::InvalidationReason;
use crate::node::Node;
use crate::registry::{Registry, Slot};
use crate::tracer::EvictionCause;

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Slots detached together with their current node.
    pub slots_evicted: usize,
    /// Replaced nodes collected from the arena.
    pub superseded_evicted: usize,
    /// Reverse edges dropped because their dependent was gone.
    pub edges_pruned: usize,
}

impl EvictionReport {
    /// Total number of nodes tombstoned.
    pub fn evicted(&self) -> usize {
        self.slots_evicted + self.superseded_evicted
    }
}

impl Registry {
    /// Evict everything that outlived the keep-alive window.
    ///
    /// Runs automatically on top-level reads when a sweep interval is
    /// configured; calling it directly is always allowed.
    pub fn sweep(&self) -> EvictionReport {
        let arena = &self.inner.arena;
        let now = self.now();
        let keep_alive = self.inner.config.keep_alive.as_millis() as u64;
        let mut report = EvictionReport::default();

        for node in arena.nodes() {
            report.edges_pruned += node.retain_dependents(|id| arena.contains(id));
        }

        let slots: Vec<(Fingerprint, Arc<Slot>)> = self
            .inner
            .slots
            .pin()
            .iter()
            .map(|(fingerprint, slot)| (fingerprint.clone(), slot.clone()))
            .collect();
        for (fingerprint, slot) in slots {
            let evicted = {
                let mut state = slot.state.lock();
                if state.in_flight || state.retired {
                    continue;
                }
                if let Some(node) = &state.current {
                    if !self.is_evictable(node, now, keep_alive) {
                        continue;
                    }
                }
                state.retired = true;
                state.current.take()
            };
            self.detach_slot(&fingerprint, &slot);
            if let Some(node) = evicted {
                self.tombstone(&node, EvictionCause::KeepAliveExpired);
                report.slots_evicted += 1;
            }
        }

        for node in arena.nodes() {
            if node.is_superseded() && self.is_evictable(&node, now, keep_alive) {
                self.tombstone(&node, EvictionCause::Superseded);
                report.superseded_evicted += 1;
            }
        }

        report
    }

    /// Sweep if the configured interval has elapsed since the last automatic sweep.
    pub(crate) fn maybe_sweep(&self) {
        let Some(interval) = self.inner.config.sweep_interval else {
            return;
        };
        let now = self.now();
        let last = self.inner.last_sweep.load(Ordering::Relaxed);
        if now.saturating_sub(last) < interval.as_millis() as u64 {
            return;
        }
        // Only one caller wins the interval.
        if self
            .inner
            .last_sweep
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let report = self.sweep();
            #[cfg(feature = "tracing")]
            tracing::trace!(
                slots = report.slots_evicted,
                superseded = report.superseded_evicted,
                edges = report.edges_pruned,
                "automatic sweep"
            );
            #[cfg(not(feature = "tracing"))]
            let _ = report;
        }
    }

    fn is_evictable(&self, node: &Node, now: u64, keep_alive: u64) -> bool {
        node.readers() == 0
            && now.saturating_sub(node.last_read()) >= keep_alive
            && (!node.is_consistent() || !self.has_consistent_dependents(node))
    }

    fn has_consistent_dependents(&self, node: &Node) -> bool {
        node.dependents().into_iter().any(|id| {
            self.inner
                .arena
                .get(id)
                .is_some_and(|dependent| dependent.is_consistent())
        })
    }

    /// Remove `node` from the arena and forget its publication.
    ///
    /// A node that is still Consistent is invalidated first, so handles that
    /// outlive the eviction never report a value nobody tracks anymore.
    pub(crate) fn tombstone(&self, node: &Arc<Node>, cause: EvictionCause) {
        self.invalidate_node(node, InvalidationReason::Evicted);
        if self.inner.arena.remove(node.id()).is_some() {
            self.inner.publications.forget(node.id());
            self.inner
                .tracer
                .on_evicted(node.fingerprint(), node.version(), cause);
        }
    }
}
