//! Fingerprints identify which cached slot a call maps to.

use std::any::Any;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Equality between two erased fingerprint arguments.
///
/// Arguments of different concrete types are never equal, even when their
/// `Debug` output matches (`1u32` vs `1u64`).
pub trait DynEq: Any {
    /// Compare against an argument of unknown type.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        match other.downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }
}

/// An argument tuple (or tag value) that can take part in a [`Fingerprint`].
///
/// Any `Hash + Eq + Debug + Send + Sync + 'static` type qualifies, so `(2, 3)`
/// or `("users", 42u64)` can be passed directly. A value that cannot be hashed
/// or compared is rejected at compile time instead of producing an unstable
/// slot identity.
pub trait CacheKey: DynHash + DynEq + Debug + Send + Sync {
    /// Erased view used by [`Fingerprint::downcast`].
    fn as_any(&self) -> &dyn Any;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> CacheKey for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

dyn_hash::hash_trait_object!(CacheKey);

/// Fingerprint of a tracked operation call: the operation identity plus its arguments.
#[derive(Clone)]
pub struct OperationKey {
    operation: &'static str,
    args: Arc<dyn CacheKey>,
}

impl OperationKey {
    /// The operation identity.
    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

impl Hash for OperationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.operation.hash(state);
        self.args.hash(state);
    }
}

impl PartialEq for OperationKey {
    fn eq(&self, other: &Self) -> bool {
        self.operation == other.operation && self.args.dyn_eq(other.args.as_any())
    }
}

impl Eq for OperationKey {}

/// Fingerprint of an invalidation tag.
///
/// Tags carry no value. A computation that reads a tag is invalidated together
/// with it, which lets data-layer code invalidate a whole family of computations
/// ("everything that read user 42") without knowing their fingerprints.
#[derive(Clone)]
pub struct TagKey {
    key: Arc<dyn CacheKey>,
}

impl Hash for TagKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialEq for TagKey {
    fn eq(&self, other: &Self) -> bool {
        self.key.dyn_eq(other.key.as_any())
    }
}

impl Eq for TagKey {}

/// Deterministic identity of a cached slot.
///
/// Two calls map to the same slot if and only if their fingerprints are equal.
/// Callers must guarantee that distinct logical operations never share a
/// fingerprint; a collision between operations with different output types is
/// reported as [`CacheError::OutputTypeMismatch`](crate::CacheError::OutputTypeMismatch),
/// a collision between operations with the same output type is not detected.
#[derive(Clone)]
pub enum Fingerprint {
    /// A tracked operation call.
    Operation(OperationKey),
    /// An invalidation tag.
    Tag(TagKey),
}

impl Fingerprint {
    /// Create a fingerprint from an operation name and its arguments.
    ///
    /// ```
    /// # use memo_flow::Fingerprint;
    /// let a = Fingerprint::new("sum", (2, 3));
    /// let b = Fingerprint::new("sum", (2, 3));
    /// assert_eq!(a, b);
    /// assert_ne!(a, Fingerprint::new("sum", (3, 2)));
    /// ```
    pub fn new<A: CacheKey + 'static>(operation: &'static str, args: A) -> Self {
        Fingerprint::Operation(OperationKey {
            operation,
            args: Arc::new(args),
        })
    }

    /// Create a fingerprint using the type name of `Op` as the operation identity.
    pub fn of<Op: ?Sized + 'static, A: CacheKey + 'static>(args: A) -> Self {
        Self::new(std::any::type_name::<Op>(), args)
    }

    /// Create a tag fingerprint.
    pub fn tag<K: CacheKey + 'static>(key: K) -> Self {
        Fingerprint::Tag(TagKey { key: Arc::new(key) })
    }

    /// Returns true if this is a tag fingerprint.
    pub fn is_tag(&self) -> bool {
        matches!(self, Fingerprint::Tag(_))
    }

    /// The operation identity, or `None` for tags.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            Fingerprint::Operation(k) => Some(k.operation()),
            Fingerprint::Tag(_) => None,
        }
    }

    /// Downcast the arguments (or tag value) to their original type.
    pub fn downcast<K: 'static>(&self) -> Option<&K> {
        match self {
            Fingerprint::Operation(k) => k.args.as_any().downcast_ref(),
            Fingerprint::Tag(k) => k.key.as_any().downcast_ref(),
        }
    }

    /// Get the debug representation of this fingerprint.
    pub fn debug_repr(&self) -> String {
        format!("{:?}", self)
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Operation(k) => write!(f, "{}{:?}", k.operation, k.args),
            Fingerprint::Tag(k) => write!(f, "Tag({:?})", k.key),
        }
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

impl Hash for Fingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Fingerprint::Operation(k) => k.hash(state),
            Fingerprint::Tag(k) => k.hash(state),
        }
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Fingerprint::Operation(a), Fingerprint::Operation(b)) => a == b,
            (Fingerprint::Tag(a), Fingerprint::Tag(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Fingerprint {}
