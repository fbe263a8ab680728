//! The registry: slots, single-flight production and the public read/invalidate API.

use std::any::Any;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use papaya::{Compute, HashMap, Operation};
use parking_lot::{Condvar, Mutex};

use crate::arena::Arena;
use crate::capture::ComputeContext;
use crate::computed::ComputedValue;
use crate::config::{CacheConfig, RegistryBuilder};
use crate::error::{CacheError, ProductionError};
use crate::fingerprint::{CacheKey, Fingerprint};
use crate::invalidation::{self, InvalidationReason, InvalidationReport};
use crate::node::{CachedOutput, Node};
use crate::publication::Publications;
use crate::reader::{Reader, Tracked};
use crate::tracer::{EvictionCause, ProductionOutcome, Tracer};
use crate::version::{Consistency, Version};

/// One fingerprint's place in the registry.
///
/// The slot serializes production: at most one caller produces at a time and
/// everyone else waits on `settled`.
#[derive(Default)]
pub(crate) struct Slot {
    pub(crate) state: Mutex<SlotState>,
    settled: Condvar,
}

#[derive(Default)]
pub(crate) struct SlotState {
    /// Most recently installed node.
    pub(crate) current: Option<Arc<Node>>,
    pub(crate) in_flight: bool,
    /// An invalidation arrived while `in_flight` was set.
    invalidated_in_flight: bool,
    /// Bumped on every install; waiters use it to tell a fresh install from an abandoned flight.
    installs: u64,
    last_version: Option<Version>,
    /// The slot was detached from the map; callers holding it must look up again.
    pub(crate) retired: bool,
}

/// Clears the in-flight marker if the producer unwinds.
struct FlightGuard<'s> {
    slot: &'s Slot,
    armed: bool,
}

impl FlightGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.slot.state.lock();
            state.in_flight = false;
            state.invalidated_in_flight = false;
            drop(state);
            self.slot.settled.notify_all();
        }
    }
}

pub(crate) struct RegistryInner {
    pub(crate) slots: HashMap<Fingerprint, Arc<Slot>, ahash::RandomState>,
    pub(crate) arena: Arena,
    pub(crate) publications: Publications,
    pub(crate) config: CacheConfig,
    pub(crate) tracer: Arc<dyn Tracer>,
    epoch: Instant,
    /// Milliseconds since `epoch` at the last automatic sweep.
    pub(crate) last_sweep: AtomicU64,
}

/// A concurrent cache of computed values.
///
/// Values are produced on first read, shared by every later reader and kept
/// until invalidated or evicted. Reads made by a producer through its
/// [`ComputeContext`] are recorded as dependencies, and invalidating a value
/// invalidates everything that (transitively) read it.
///
/// `Registry` is cheap to clone; clones share the same cache.
///
/// # Example
///
/// ```
/// use memo_flow::{Fingerprint, Registry};
///
/// let registry = Registry::new();
/// let fp = Fingerprint::new("sum", (2, 3));
///
/// let first = registry.get_or_compute(fp.clone(), |_| Ok(2 + 3)).unwrap();
/// assert_eq!(*first.value().unwrap(), 5);
/// assert_eq!(first.version().0, 1);
///
/// registry.invalidate(&fp);
/// assert!(!first.is_consistent());
///
/// let second = registry.get_or_compute(fp, |_| Ok(2 + 3)).unwrap();
/// assert_eq!(second.version().0, 2);
/// ```
#[derive(Clone)]
pub struct Registry {
    pub(crate) inner: Arc<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create a registry with default settings.
    pub fn new() -> Self {
        RegistryBuilder::new().build()
    }

    /// Create a builder for customizing the registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub(crate) fn from_parts(config: CacheConfig, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: HashMap::with_hasher(ahash::RandomState::new()),
                arena: Arena::new(),
                publications: Publications::new(),
                config,
                tracer,
                epoch: Instant::now(),
                last_sweep: AtomicU64::new(0),
            }),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub(crate) fn tracer(&self) -> &dyn Tracer {
        &*self.inner.tracer
    }

    /// Milliseconds since the registry was created.
    pub(crate) fn now(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read the value for `fingerprint`, producing it with `producer` if no
    /// Consistent value is cached.
    ///
    /// Concurrent callers for the same fingerprint share one production. Reads
    /// made directly on the registry are not recorded as dependencies; use the
    /// [`ComputeContext`] passed to the producer for nested reads.
    pub fn get_or_compute<T, F>(
        &self,
        fingerprint: Fingerprint,
        producer: F,
    ) -> Result<ComputedValue<T>, CacheError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&ComputeContext<'_>) -> anyhow::Result<T>,
    {
        self.fetch(fingerprint, producer, None, None)
    }

    /// Like [`get_or_compute`](Self::get_or_compute), but stop waiting for
    /// another caller's production at `deadline`.
    ///
    /// Returns [`CacheError::Cancelled`] on timeout. The production itself
    /// continues and its result is installed for later readers. A caller that
    /// ends up producing is never interrupted.
    pub fn get_or_compute_until<T, F>(
        &self,
        fingerprint: Fingerprint,
        deadline: Instant,
        producer: F,
    ) -> Result<ComputedValue<T>, CacheError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&ComputeContext<'_>) -> anyhow::Result<T>,
    {
        self.fetch(fingerprint, producer, None, Some(deadline))
    }

    /// Read the value of a tracked operation.
    pub fn compute<O: Tracked>(&self, op: O) -> Result<ComputedValue<O::Output>, CacheError> {
        let fingerprint = op.fingerprint();
        self.fetch(fingerprint, move |ctx| op.produce(ctx), None, None)
    }

    pub(crate) fn fetch<T, F>(
        &self,
        fingerprint: Fingerprint,
        producer: F,
        parent: Option<&ComputeContext<'_>>,
        deadline: Option<Instant>,
    ) -> Result<ComputedValue<T>, CacheError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&ComputeContext<'_>) -> anyhow::Result<T>,
    {
        match parent {
            Some(parent) => {
                if let Some(path) = parent.cycle_path(&fingerprint) {
                    self.inner.tracer.on_cycle_detected(&path);
                    return Err(CacheError::Cycle { path });
                }
            }
            None => self.maybe_sweep(),
        }

        loop {
            let slot = self.slot(&fingerprint);
            let mut state = slot.state.lock();
            if state.retired {
                drop(state);
                std::thread::yield_now();
                continue;
            }

            let hit = state.current.clone().filter(|node| node.is_consistent());
            if let Some(node) = hit {
                // The reader is acquired under the slot lock so a concurrent
                // sweep cannot evict the node in between.
                let value = ComputedValue::from_node(node)?;
                drop(state);
                self.inner.tracer.on_cache_hit(&fingerprint, value.version());
                return Ok(self.observe(value, parent));
            }

            if state.in_flight {
                let seen = state.installs;
                self.inner.tracer.on_wait(&fingerprint);
                while state.in_flight {
                    match deadline {
                        Some(deadline) => {
                            if slot.settled.wait_until(&mut state, deadline).timed_out()
                                && state.in_flight
                            {
                                return Err(CacheError::Cancelled {
                                    fingerprint: fingerprint.debug_repr(),
                                });
                            }
                        }
                        None => slot.settled.wait(&mut state),
                    }
                }
                if state.installs != seen {
                    if let Some(node) = state.current.clone() {
                        let value = ComputedValue::from_node(node)?;
                        drop(state);
                        return Ok(self.observe(value, parent));
                    }
                }
                // The producer unwound without installing anything.
                continue;
            }

            state.in_flight = true;
            state.invalidated_in_flight = false;
            let version = state.last_version.map_or(Version::INITIAL, Version::next);
            drop(state);

            let value = self.produce(&slot, fingerprint, version, producer, parent)?;
            return Ok(self.observe(value, parent));
        }
    }

    fn observe<T>(
        &self,
        value: ComputedValue<T>,
        parent: Option<&ComputeContext<'_>>,
    ) -> ComputedValue<T> {
        value.node().touch(self.now());
        if let Some(parent) = parent {
            parent.record_read(value.node());
        }
        value
    }

    fn produce<T, F>(
        &self,
        slot: &Arc<Slot>,
        fingerprint: Fingerprint,
        version: Version,
        producer: F,
        parent: Option<&ComputeContext<'_>>,
    ) -> Result<ComputedValue<T>, CacheError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&ComputeContext<'_>) -> anyhow::Result<T>,
    {
        let guard = FlightGuard {
            slot: slot.as_ref(),
            armed: true,
        };
        let tracer = &self.inner.tracer;
        let span_id = tracer.new_span_id();
        tracer.on_production_start(span_id, &fingerprint);

        let ctx = ComputeContext::new(self, fingerprint.clone(), parent);
        let result = producer(&ctx);
        let dependencies = ctx.finish();

        let (output, outcome) = match result {
            Ok(value) => (
                CachedOutput::Value(Arc::new(value) as Arc<dyn Any + Send + Sync>),
                ProductionOutcome::Succeeded,
            ),
            Err(error) => {
                let message = format!("{error:#}");
                (
                    CachedOutput::Failed(ProductionError::new(error)),
                    ProductionOutcome::Failed { message },
                )
            }
        };

        let now = self.now();
        let node = self
            .inner
            .arena
            .insert(|id| Node::new(id, fingerprint, version, dependencies, output, now));
        let mut stale = self.link(&node).then_some(InvalidationReason::StaleDependency);

        let (value, previous) = {
            let mut state = slot.state.lock();
            if state.invalidated_in_flight && stale.is_none() {
                stale = Some(InvalidationReason::InvalidatedInFlight);
            }
            // A racing fan-out may have flipped the node already; it reported the flip.
            if stale.is_some() && !node.mark_invalidated() {
                stale = None;
            }
            let value = ComputedValue::from_node(node.clone());
            let previous = state.current.replace(node.clone());
            state.last_version = Some(version);
            state.installs += 1;
            state.in_flight = false;
            state.invalidated_in_flight = false;
            (value, previous)
        };
        guard.disarm();
        slot.settled.notify_all();

        if let Some(previous) = previous {
            previous.mark_superseded();
        }
        tracer.on_production_end(span_id, node.fingerprint(), version, outcome);
        if let Some(reason) = stale {
            tracer.on_invalidated(node.fingerprint(), version, &reason);
        }
        value
    }

    /// Register `node` as a dependent of everything it read.
    ///
    /// Returns true if any dependency was already Invalidated or evicted, in
    /// which case the node is stale from birth. The edge is added before the
    /// flag is checked, so an invalidation racing with this call either sees
    /// the edge or is seen here.
    fn link(&self, node: &Arc<Node>) -> bool {
        if node.dependencies().is_empty() {
            return false;
        }
        let mut stale = false;
        for dependency in node.dependencies().iter() {
            match self.inner.arena.get(dependency) {
                Some(dependency) => {
                    dependency.add_dependent(node.id());
                    if !dependency.is_consistent() {
                        stale = true;
                    }
                }
                None => stale = true,
            }
        }
        stale
    }

    pub(crate) fn slot(&self, fingerprint: &Fingerprint) -> Arc<Slot> {
        let pinned = self.inner.slots.pin();
        if let Some(slot) = pinned.get(fingerprint) {
            return slot.clone();
        }
        pinned
            .get_or_insert_with(fingerprint.clone(), || Arc::new(Slot::default()))
            .clone()
    }

    fn existing_slot(&self, fingerprint: &Fingerprint) -> Option<Arc<Slot>> {
        self.inner.slots.pin().get(fingerprint).cloned()
    }

    /// Remove `slot` from the map if it is still the one registered for `fingerprint`.
    pub(crate) fn detach_slot(&self, fingerprint: &Fingerprint, slot: &Arc<Slot>) -> bool {
        let pinned = self.inner.slots.pin();
        let result = pinned.compute(fingerprint.clone(), |entry| match entry {
            Some((_, current)) if Arc::ptr_eq(current, slot) => Operation::Remove,
            _ => Operation::Abort(()),
        });
        matches!(result, Compute::Removed(_, _))
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Invalidate the value cached for `fingerprint` and everything that read it.
    ///
    /// Returns true if a Consistent value was flipped. Invalidating a value
    /// that is still being produced makes that production install an
    /// Invalidated node.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        self.invalidate_with_report(fingerprint).root_invalidated
    }

    /// Like [`invalidate`](Self::invalidate), reporting how far the invalidation spread.
    pub fn invalidate_with_report(&self, fingerprint: &Fingerprint) -> InvalidationReport {
        let Some(slot) = self.existing_slot(fingerprint) else {
            return InvalidationReport::default();
        };
        let current = {
            let mut state = slot.state.lock();
            if state.in_flight {
                state.invalidated_in_flight = true;
            }
            state.current.clone()
        };
        match current {
            Some(node) => self.invalidate_node(&node, InvalidationReason::Explicit),
            None => InvalidationReport::default(),
        }
    }

    /// Invalidate the exact instance behind `value`.
    ///
    /// Unlike [`invalidate`](Self::invalidate) this never touches a newer
    /// value installed in the same slot. Returns false for a value that was
    /// produced by another registry.
    pub fn invalidate_value<T>(&self, value: &ComputedValue<T>) -> bool {
        if !self.owns(value.node()) {
            return false;
        }
        self.invalidate_node(value.node(), InvalidationReason::Explicit)
            .root_invalidated
    }

    /// Invalidate the tag `key` and every value that depends on it.
    pub fn invalidate_tag<K: CacheKey + 'static>(&self, key: K) -> bool {
        self.invalidate(&Fingerprint::tag(key))
    }

    /// True if `node` is live in this registry's arena. Values handed out by
    /// another registry, and values already evicted, are not.
    pub(crate) fn owns(&self, node: &Arc<Node>) -> bool {
        self.inner
            .arena
            .get(node.id())
            .is_some_and(|live| Arc::ptr_eq(&live, node))
    }

    pub(crate) fn invalidate_node(
        &self,
        node: &Arc<Node>,
        reason: InvalidationReason,
    ) -> InvalidationReport {
        invalidation::invalidate(&self.inner.arena, &*self.inner.tracer, node, reason)
    }

    // ------------------------------------------------------------------
    // Removal and inspection
    // ------------------------------------------------------------------

    /// Remove the slot for `fingerprint`, invalidating its value and dependents.
    ///
    /// The next read produces from scratch, starting a new lineage at version 1.
    /// Returns false if nothing was cached. A slot that is being produced is
    /// only invalidated; it stays registered until its production installs.
    pub fn remove(&self, fingerprint: &Fingerprint) -> bool {
        let Some(slot) = self.existing_slot(fingerprint) else {
            return false;
        };
        let node = {
            let mut state = slot.state.lock();
            if state.in_flight {
                state.invalidated_in_flight = true;
                let current = state.current.clone();
                drop(state);
                if let Some(node) = current {
                    self.invalidate_node(&node, InvalidationReason::Removed);
                }
                return false;
            }
            if state.retired {
                return false;
            }
            state.retired = true;
            state.current.take()
        };
        self.detach_slot(fingerprint, &slot);
        match node {
            Some(node) => {
                self.invalidate_node(&node, InvalidationReason::Removed);
                self.tombstone(&node, EvictionCause::Removed);
                true
            }
            None => false,
        }
    }

    /// Remove every slot and tombstone every node.
    pub fn clear(&self) {
        for fingerprint in self.fingerprints() {
            self.remove(&fingerprint);
        }
        for node in self.inner.arena.nodes() {
            self.invalidate_node(&node, InvalidationReason::Removed);
            self.tombstone(&node, EvictionCause::Removed);
        }
    }

    /// Version and consistency of the value currently cached for `fingerprint`.
    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<(Version, Consistency)> {
        let slot = self.existing_slot(fingerprint)?;
        let state = slot.state.lock();
        state
            .current
            .as_ref()
            .map(|node| (node.version(), node.consistency()))
    }

    /// Returns true if a value (Consistent or not) is cached for `fingerprint`.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.peek(fingerprint).is_some()
    }

    /// Number of registered slots.
    pub fn len(&self) -> usize {
        self.inner.slots.pin().len()
    }

    /// Returns true if no slot is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of nodes still held by the arena, including superseded ones.
    pub fn node_count(&self) -> usize {
        self.inner.arena.len()
    }

    /// Fingerprints of all registered slots.
    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.inner.slots.pin().keys().cloned().collect()
    }
}

impl Reader for Registry {
    fn get_or_compute<T, F>(
        &self,
        fingerprint: Fingerprint,
        producer: F,
    ) -> Result<ComputedValue<T>, CacheError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&ComputeContext<'_>) -> anyhow::Result<T>,
    {
        Registry::get_or_compute(self, fingerprint, producer)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("slots", &self.len())
            .field("nodes", &self.node_count())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
