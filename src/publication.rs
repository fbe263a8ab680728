//! Remote consistency protocol.
//!
//! A service that returns a computed value to a remote caller can publish it:
//! the value gets a [`ReferenceId`] that is written to the response metadata
//! together with its version and consistency. The remote side later asks
//! [`Registry::query_consistency`] (through whatever transport the service
//! exposes) whether that reference is still Consistent, and refetches once it
//! is not.
//!
//! Metadata travels as three headers:
//!
//! | header                   | value                          |
//! |--------------------------|--------------------------------|
//! | `x-computed-reference`   | reference id, e.g. `12.408`    |
//! | `x-computed-version`     | version number                 |
//! | `x-computed-consistency` | `consistent` or `invalidated`  |
//!
//! A request opts in with `x-computed-publish: true`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::arena::NodeId;
use crate::computed::ComputedValue;
use crate::error::PublicationError;
use crate::registry::Registry;
use crate::version::{Consistency, Version};

/// Header carrying the [`ReferenceId`].
pub const REFERENCE_HEADER: &str = "x-computed-reference";
/// Header carrying the published version.
pub const VERSION_HEADER: &str = "x-computed-version";
/// Header carrying the consistency at publication time.
pub const CONSISTENCY_HEADER: &str = "x-computed-consistency";
/// Request header asking the service to publish its response value.
pub const PUBLISH_REQUEST_HEADER: &str = "x-computed-publish";

/// Stable identifier of one published value.
///
/// Reference ids are derived from arena ids, so an id is never reused for a
/// different value of the same registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReferenceId {
    index: u32,
    generation: u64,
}

impl ReferenceId {
    pub(crate) fn node_id(&self) -> NodeId {
        NodeId::from_parts(self.index, self.generation)
    }
}

impl From<NodeId> for ReferenceId {
    fn from(id: NodeId) -> Self {
        Self {
            index: id.index(),
            generation: id.generation(),
        }
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// Error parsing a [`ReferenceId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid reference id {0:?}")]
pub struct ParseReferenceIdError(String);

impl FromStr for ReferenceId {
    type Err = ParseReferenceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseReferenceIdError(s.to_string());
        let (index, generation) = s.split_once('.').ok_or_else(err)?;
        Ok(Self {
            index: index.parse().map_err(|_| err())?,
            generation: generation.parse().map_err(|_| err())?,
        })
    }
}

impl Serialize for ReferenceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReferenceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// What a remote caller receives alongside a published value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationHandle {
    /// Identifier to poll with.
    pub reference_id: ReferenceId,
    /// Version of the published value.
    pub version: Version,
    /// Consistency at publication time.
    pub consistency: Consistency,
}

impl PublicationHandle {
    /// Header pairs describing this publication.
    pub fn to_headers(&self) -> [(&'static str, String); 3] {
        [
            (REFERENCE_HEADER, self.reference_id.to_string()),
            (VERSION_HEADER, self.version.0.to_string()),
            (CONSISTENCY_HEADER, self.consistency.as_str().to_string()),
        ]
    }

    /// Read a publication back from headers, `get` returning the value of a
    /// header by (lowercase) name.
    pub fn from_headers<'h>(
        mut get: impl FnMut(&str) -> Option<&'h str>,
    ) -> Result<Self, PublicationError> {
        let mut header = |name: &'static str| {
            get(name)
                .map(str::trim)
                .ok_or(PublicationError::MissingHeader { header: name })
        };
        let malformed = |header: &'static str, value: &str| PublicationError::MalformedHeader {
            header,
            value: value.to_string(),
        };

        let reference = header(REFERENCE_HEADER)?;
        let version = header(VERSION_HEADER)?;
        let consistency = header(CONSISTENCY_HEADER)?;
        Ok(Self {
            reference_id: reference
                .parse()
                .map_err(|_| malformed(REFERENCE_HEADER, reference))?,
            version: version
                .parse()
                .map(Version)
                .map_err(|_| malformed(VERSION_HEADER, version))?,
            consistency: Consistency::parse(consistency)
                .ok_or_else(|| malformed(CONSISTENCY_HEADER, consistency))?,
        })
    }
}

/// Answer to a consistency query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsistencyReport {
    /// The reference is still tracked.
    Found {
        /// Version of the referenced value.
        version: Version,
        /// Current consistency.
        consistency: Consistency,
    },
    /// The reference was never published, was unpublished, or its value was evicted.
    NotFound,
}

impl ConsistencyReport {
    /// Returns true if the remote copy should be refetched.
    pub fn is_stale(&self) -> bool {
        !matches!(
            self,
            ConsistencyReport::Found {
                consistency: Consistency::Consistent,
                ..
            }
        )
    }
}

/// Returns true if the request headers ask for publication.
pub fn publication_requested<'h>(get: impl FnOnce(&str) -> Option<&'h str>) -> bool {
    get(PUBLISH_REQUEST_HEADER).is_some_and(|value| {
        let value = value.trim();
        value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
    })
}

/// Published references of one registry.
pub(crate) struct Publications {
    entries: papaya::HashMap<ReferenceId, Version, ahash::RandomState>,
}

impl Publications {
    pub fn new() -> Self {
        Self {
            entries: papaya::HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    pub fn insert(&self, reference_id: ReferenceId, version: Version) {
        self.entries.pin().insert(reference_id, version);
    }

    pub fn get(&self, reference_id: &ReferenceId) -> Option<Version> {
        self.entries.pin().get(reference_id).copied()
    }

    pub fn remove(&self, reference_id: &ReferenceId) -> bool {
        self.entries.pin().remove(reference_id).is_some()
    }

    pub fn forget(&self, id: NodeId) {
        self.remove(&ReferenceId::from(id));
    }

    pub fn len(&self) -> usize {
        self.entries.pin().len()
    }
}

impl Registry {
    /// Publish `value` for remote consistency queries.
    ///
    /// Publishing the same value twice returns the same reference. A value
    /// produced by another registry is not recorded, so queries for its
    /// reference report [`ConsistencyReport::NotFound`].
    pub fn publish<T>(&self, value: &ComputedValue<T>) -> PublicationHandle {
        let node = value.node();
        let handle = PublicationHandle {
            reference_id: ReferenceId::from(node.id()),
            version: node.version(),
            consistency: node.consistency(),
        };
        if self.owns(node) {
            self.inner
                .publications
                .insert(handle.reference_id, handle.version);
            self.inner.tracer.on_published(node.fingerprint(), &handle);
        }
        handle
    }

    /// Publish `value` and attach it to the response `metadata`.
    ///
    /// Fails with [`PublicationError::Conflict`] if the response already
    /// carries a publication, and with [`PublicationError::ForeignValue`] if
    /// `value` is not held by this registry. Nothing is published on failure.
    pub fn publish_into<T, S: MetadataSink>(
        &self,
        value: &ComputedValue<T>,
        metadata: &mut ResponseMetadata<S>,
    ) -> Result<PublicationHandle, PublicationError> {
        if let Some(existing) = metadata.published() {
            return Err(PublicationError::Conflict {
                existing: existing.reference_id,
            });
        }
        if !self.owns(value.node()) {
            return Err(PublicationError::ForeignValue {
                reference: ReferenceId::from(value.node().id()),
            });
        }
        let handle = self.publish(value);
        metadata.attach(handle.clone())?;
        Ok(handle)
    }

    /// Current version and consistency of a published reference.
    pub fn query_consistency(&self, reference_id: &ReferenceId) -> ConsistencyReport {
        let Some(version) = self.inner.publications.get(reference_id) else {
            return ConsistencyReport::NotFound;
        };
        match self.inner.arena.get(reference_id.node_id()) {
            Some(node) => ConsistencyReport::Found {
                version,
                consistency: node.consistency(),
            },
            None => {
                self.inner.publications.remove(reference_id);
                ConsistencyReport::NotFound
            }
        }
    }

    /// Stop answering queries for `reference_id`.
    pub fn unpublish(&self, reference_id: &ReferenceId) -> bool {
        self.inner.publications.remove(reference_id)
    }

    /// Number of live publications.
    pub fn publication_count(&self) -> usize {
        self.inner.publications.len()
    }
}

/// Destination for response metadata, such as a header map.
pub trait MetadataSink {
    /// Set `name` to `value`.
    fn insert_metadata(&mut self, name: &'static str, value: String);
}

impl MetadataSink for HashMap<String, String> {
    fn insert_metadata(&mut self, name: &'static str, value: String) {
        self.insert(name.to_string(), value);
    }
}

impl MetadataSink for BTreeMap<String, String> {
    fn insert_metadata(&mut self, name: &'static str, value: String) {
        self.insert(name.to_string(), value);
    }
}

impl MetadataSink for Vec<(String, String)> {
    fn insert_metadata(&mut self, name: &'static str, value: String) {
        self.push((name.to_string(), value));
    }
}

impl<S: MetadataSink + ?Sized> MetadataSink for &mut S {
    fn insert_metadata(&mut self, name: &'static str, value: String) {
        (**self).insert_metadata(name, value)
    }
}

/// Response metadata channel of one exchange.
///
/// Carries at most one publication.
#[derive(Debug)]
pub struct ResponseMetadata<S> {
    sink: S,
    published: Option<PublicationHandle>,
}

impl<S: MetadataSink> ResponseMetadata<S> {
    /// Wrap a sink.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            published: None,
        }
    }

    /// Write `handle` to the sink.
    pub fn attach(&mut self, handle: PublicationHandle) -> Result<(), PublicationError> {
        if let Some(existing) = &self.published {
            return Err(PublicationError::Conflict {
                existing: existing.reference_id,
            });
        }
        for (name, value) in handle.to_headers() {
            self.sink.insert_metadata(name, value);
        }
        self.published = Some(handle);
        Ok(())
    }

    /// The publication attached so far.
    pub fn published(&self) -> Option<&PublicationHandle> {
        self.published.as_ref()
    }

    /// The wrapped sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Unwrap the sink.
    pub fn into_inner(self) -> S {
        self.sink
    }
}
