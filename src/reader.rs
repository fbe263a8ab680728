//! Tracked operations and the common read interface.

use crate::capture::ComputeContext;
use crate::computed::ComputedValue;
use crate::error::CacheError;
use crate::fingerprint::{CacheKey, Fingerprint};

/// An operation whose result is cached under its fingerprint.
///
/// Reads made through the context passed to [`produce`](Tracked::produce)
/// become the dependencies of the result.
///
/// # Example
///
/// ```
/// use memo_flow::{ComputeContext, Fingerprint, Registry, Tracked};
///
/// struct Sum(i64, i64);
///
/// impl Tracked for Sum {
///     type Output = i64;
///
///     fn fingerprint(&self) -> Fingerprint {
///         Fingerprint::new("sum", (self.0, self.1))
///     }
///
///     fn produce(self, _ctx: &ComputeContext<'_>) -> anyhow::Result<i64> {
///         Ok(self.0 + self.1)
///     }
/// }
///
/// let registry = Registry::new();
/// let value = registry.compute(Sum(2, 3)).unwrap();
/// assert_eq!(*value.value().unwrap(), 5);
/// ```
pub trait Tracked: Sized {
    /// The produced value.
    type Output: Send + Sync + 'static;

    /// Fingerprint identifying this call.
    ///
    /// Two calls with equal fingerprints must produce interchangeable results.
    fn fingerprint(&self) -> Fingerprint;

    /// Produce the value.
    ///
    /// An `Err` is cached like a value and replayed to every reader until the
    /// slot is invalidated.
    fn produce(self, ctx: &ComputeContext<'_>) -> anyhow::Result<Self::Output>;
}

/// Read access shared by [`Registry`](crate::Registry) and [`ComputeContext`].
///
/// - `Registry::get_or_compute()`: no dependency recording
/// - `ComputeContext::get_or_compute()`: records the read into the running production
///
/// Helpers generic over `Reader` can be called both from application code and
/// from inside producers.
pub trait Reader {
    /// Read the value for `fingerprint`, producing it with `producer` if no
    /// Consistent value is cached.
    fn get_or_compute<T, F>(
        &self,
        fingerprint: Fingerprint,
        producer: F,
    ) -> Result<ComputedValue<T>, CacheError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&ComputeContext<'_>) -> anyhow::Result<T>;

    /// Read the value of a tracked operation.
    fn compute<O: Tracked>(&self, op: O) -> Result<ComputedValue<O::Output>, CacheError> {
        let fingerprint = op.fingerprint();
        self.get_or_compute(fingerprint, move |ctx| op.produce(ctx))
    }

    /// Read the tag `key`. From inside a producer this makes the production
    /// depend on the tag.
    fn depend_on_tag<K: CacheKey + 'static>(&self, key: K) -> Result<(), CacheError> {
        self.get_or_compute(Fingerprint::tag(key), |_| Ok(()))
            .map(drop)
    }
}
