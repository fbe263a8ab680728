//! Transitive invalidation over the dependents index.
//!
//! Invalidation is a pure mark phase: it flips consistency flags and never
//! recomputes anything. The flag itself is the visited marker, so two racing
//! invalidations of overlapping subgraphs flip every node exactly once and
//! neither needs a visited set.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::arena::{Arena, NodeId};
use crate::fingerprint::Fingerprint;
use crate::node::Node;
use crate::tracer::Tracer;

/// Why a node was invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    /// Application code called `invalidate`.
    Explicit,
    /// A (transitive) dependency was invalidated.
    DependencyInvalidated {
        /// Fingerprint whose invalidation started the fan-out.
        source: Fingerprint,
    },
    /// A dependency had already been invalidated or evicted when the node was installed.
    StaleDependency,
    /// An invalidation arrived while the value was being produced.
    InvalidatedInFlight,
    /// The slot was removed.
    Removed,
    /// The node was evicted while still Consistent.
    Evicted,
}

/// Outcome of one invalidation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// The root was Consistent and this call flipped it.
    pub root_invalidated: bool,
    /// Number of transitive dependents flipped by this call, excluding the root.
    pub invalidated: usize,
    /// Dependents that were already evicted when visited.
    pub skipped: usize,
}

/// Flip `root` and every transitive dependent that is still Consistent.
///
/// Nodes that were already Invalidated stop the walk: whoever flipped them
/// owns their dependents. Edges that no longer resolve are skipped.
pub(crate) fn invalidate(
    arena: &Arena,
    tracer: &dyn Tracer,
    root: &Arc<Node>,
    reason: InvalidationReason,
) -> InvalidationReport {
    let mut report = InvalidationReport::default();
    if !root.mark_invalidated() {
        return report;
    }
    report.root_invalidated = true;
    tracer.on_invalidated(root.fingerprint(), root.version(), &reason);

    // Dependents are read after the flip; a dependent linked afterwards sees
    // the flag and invalidates itself.
    let mut queue: VecDeque<NodeId> = root.dependents().into();
    let source = root.fingerprint().clone();
    while let Some(id) = queue.pop_front() {
        let Some(node) = arena.get(id) else {
            report.skipped += 1;
            continue;
        };
        if !node.mark_invalidated() {
            continue;
        }
        report.invalidated += 1;
        tracer.on_invalidated(
            node.fingerprint(),
            node.version(),
            &InvalidationReason::DependencyInvalidated {
                source: source.clone(),
            },
        );
        queue.extend(node.dependents());
    }
    report
}
