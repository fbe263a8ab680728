//! Dependency capture for running productions.
//!
//! Every production receives a [`ComputeContext`]. Reads made through the
//! context are recorded into its capture frame, which becomes the
//! dependency set of the produced node. Reads made directly on the
//! [`Registry`] from inside a producer are untracked.

use parking_lot::Mutex;

use crate::arena::NodeId;
use crate::computed::ComputedValue;
use crate::error::CacheError;
use crate::fingerprint::{CacheKey, Fingerprint};
use crate::node::{Dependencies, Node};
use crate::reader::{Reader, Tracked};
use crate::registry::Registry;

/// The reads of one production run.
///
/// Frames are never shared between productions, so the lock is uncontended
/// unless a producer reads from several threads of its own.
#[derive(Debug)]
pub(crate) struct CaptureFrame {
    reads: Mutex<Vec<NodeId>>,
}

impl CaptureFrame {
    pub fn begin() -> Self {
        Self {
            reads: Mutex::new(Vec::new()),
        }
    }

    pub fn record_read(&self, node: &Node) {
        self.reads.lock().push(node.id());
    }

    pub fn len(&self) -> usize {
        self.reads.lock().len()
    }

    pub fn finish(self) -> Dependencies {
        Dependencies::from_reads(self.reads.into_inner())
    }
}

/// Context handed to a producer.
///
/// Nested productions form a chain of contexts through `parent`; the chain is
/// the set of productions currently active on this call stack and is what
/// cycle detection walks.
pub struct ComputeContext<'a> {
    registry: &'a Registry,
    fingerprint: Fingerprint,
    frame: CaptureFrame,
    parent: Option<&'a ComputeContext<'a>>,
}

impl<'a> ComputeContext<'a> {
    pub(crate) fn new(
        registry: &'a Registry,
        fingerprint: Fingerprint,
        parent: Option<&'a ComputeContext<'a>>,
    ) -> Self {
        Self {
            registry,
            fingerprint,
            frame: CaptureFrame::begin(),
            parent,
        }
    }

    /// Fingerprint of the value being produced.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// The registry this production runs in.
    ///
    /// Reads made directly on the registry are not recorded as dependencies.
    pub fn registry(&self) -> &Registry {
        self.registry
    }

    /// Number of reads recorded so far, including repeated reads.
    pub fn recorded_reads(&self) -> usize {
        self.frame.len()
    }

    /// Read (or produce) the value for `fingerprint` and record it as a dependency.
    pub fn get_or_compute<T, F>(
        &self,
        fingerprint: Fingerprint,
        producer: F,
    ) -> Result<ComputedValue<T>, CacheError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&ComputeContext<'_>) -> anyhow::Result<T>,
    {
        self.registry.fetch(fingerprint, producer, Some(self), None)
    }

    /// Read (or produce) a tracked operation and record it as a dependency.
    pub fn compute<O: Tracked>(&self, op: O) -> Result<ComputedValue<O::Output>, CacheError> {
        let fingerprint = op.fingerprint();
        self.get_or_compute(fingerprint, move |ctx| op.produce(ctx))
    }

    /// Make the running production depend on the tag `key`.
    ///
    /// Invalidating the tag with [`Registry::invalidate_tag`] later invalidates
    /// this value.
    pub fn depend_on_tag<K: CacheKey + 'static>(&self, key: K) -> Result<(), CacheError> {
        self.get_or_compute(Fingerprint::tag(key), |_| Ok(()))
            .map(drop)
    }

    pub(crate) fn record_read(&self, node: &Node) {
        self.frame.record_read(node);
        self.registry
            .tracer()
            .on_dependency_recorded(&self.fingerprint, node.fingerprint());
    }

    /// If `fingerprint` is already being produced on this chain, the cycle
    /// from that production back to itself.
    pub(crate) fn cycle_path(&self, fingerprint: &Fingerprint) -> Option<Vec<String>> {
        let mut chain = Vec::new();
        let mut cursor = Some(self);
        while let Some(ctx) = cursor {
            chain.push(ctx.fingerprint.debug_repr());
            if &ctx.fingerprint == fingerprint {
                chain.reverse();
                chain.push(fingerprint.debug_repr());
                return Some(chain);
            }
            cursor = ctx.parent;
        }
        None
    }

    pub(crate) fn finish(self) -> Dependencies {
        self.frame.finish()
    }
}

impl Reader for ComputeContext<'_> {
    fn get_or_compute<T, F>(
        &self,
        fingerprint: Fingerprint,
        producer: F,
    ) -> Result<ComputedValue<T>, CacheError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&ComputeContext<'_>) -> anyhow::Result<T>,
    {
        ComputeContext::get_or_compute(self, fingerprint, producer)
    }
}

impl std::fmt::Debug for ComputeContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("fingerprint", &self.fingerprint)
            .field("recorded_reads", &self.frame.len())
            .finish_non_exhaustive()
    }
}
