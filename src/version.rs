use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Version is a monotonically increasing number within a slot lineage.
///
/// The first value produced for a fingerprint has version 1 and every
/// replacement of an invalidated value increments it by exactly one.
/// Versions of different fingerprints are not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    /// The version of the first value in a lineage.
    pub const INITIAL: Version = Version(1);

    /// The version that follows this one.
    #[must_use]
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Consistency state of a computed value.
///
/// The only transition is `Consistent -> Invalidated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// The value reflects the current state of everything it read.
    Consistent,
    /// Something the value read has changed; the next read recomputes it.
    Invalidated,
}

impl Consistency {
    /// Wire representation used by the consistency protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Consistency::Consistent => "consistent",
            Consistency::Invalidated => "invalidated",
        }
    }

    /// Parse the wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "consistent" => Some(Consistency::Consistent),
            "invalidated" => Some(Consistency::Invalidated),
            _ => None,
        }
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CONSISTENT: u8 = 0;
const INVALIDATED: u8 = 1;

/// Atomic consistency flag. Doubles as the "visited" marker of invalidation traversal.
#[derive(Debug)]
pub(crate) struct ConsistencyFlag(AtomicU8);

impl ConsistencyFlag {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(CONSISTENT))
    }

    pub(crate) fn get(&self) -> Consistency {
        match self.0.load(Ordering::SeqCst) {
            CONSISTENT => Consistency::Consistent,
            _ => Consistency::Invalidated,
        }
    }

    /// Flip to `Invalidated`. Returns true only for the caller that performed the flip.
    pub(crate) fn invalidate(&self) -> bool {
        self.0
            .compare_exchange(CONSISTENT, INVALIDATED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
