//! Session entries and the mutations applied to them.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque serialized attribute payload.
///
/// The store never interprets these bytes; see [`crate::AttributeCodec`]
/// for turning typed values into payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeValue(Vec<u8>);

impl AttributeValue {
    /// Wrap raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Borrow the payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take the payload.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for AttributeValue {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

/// A stored session.
///
/// Also serves as the full-state snapshot shipped to backups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    /// Externally generated session identifier.
    pub id: String,

    /// Attribute name to opaque payload.
    pub attributes: BTreeMap<String, AttributeValue>,

    /// Set once when the entry is first written.
    pub created_at: DateTime<Utc>,

    /// Refreshed on every write and (with touch-on-read) every read.
    pub last_accessed_at: DateTime<Utc>,

    /// Per-entry idle timeout override, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    /// Incremented on every mutation.
    pub version: u64,
}

impl SessionEntry {
    /// Create an empty entry at version 0.
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            attributes: BTreeMap::new(),
            created_at: now,
            last_accessed_at: now,
            idle_timeout_secs: None,
            version: 0,
        }
    }

    /// Look up an attribute.
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Idle timeout for this entry, falling back to the store default.
    pub fn idle_timeout(&self, default: Duration) -> Duration {
        self.idle_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Refresh the access time. Never moves it before `created_at`.
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed_at = now.max(self.created_at);
    }

    /// Apply a local mutation body (no version change).
    ///
    /// `Invalidate` is handled by the store, not here.
    pub(crate) fn apply(&mut self, mutation: &Mutation, now: DateTime<Utc>) {
        match mutation {
            Mutation::SetAttribute { name, value } => {
                self.attributes.insert(name.clone(), value.clone());
            }
            Mutation::RemoveAttribute { name } => {
                self.attributes.remove(name);
            }
            Mutation::SetIdleTimeout { seconds } => {
                self.idle_timeout_secs = *seconds;
            }
            Mutation::Sync { entry } => {
                self.attributes = entry.attributes.clone();
                self.idle_timeout_secs = entry.idle_timeout_secs;
            }
            Mutation::Touch | Mutation::Invalidate => {}
        }
        self.touch(now);
    }
}

/// A change to one session, as routed through the replication manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Set one attribute, creating the entry if absent.
    SetAttribute { name: String, value: AttributeValue },
    /// Remove one attribute.
    RemoveAttribute { name: String },
    /// Refresh the idle timer.
    Touch,
    /// Override (or clear) the per-entry idle timeout.
    SetIdleTimeout { seconds: Option<u64> },
    /// Remove the entry.
    Invalidate,
    /// Replace the entry with a full snapshot.
    Sync { entry: SessionEntry },
}

impl Mutation {
    /// Whether this mutation may create an entry that does not exist yet.
    pub fn creates(&self) -> bool {
        matches!(self, Mutation::SetAttribute { .. } | Mutation::Sync { .. })
    }

    /// Whether this mutation removes the entry.
    pub fn is_removal(&self) -> bool {
        matches!(self, Mutation::Invalidate)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::SetAttribute { .. } => "set_attribute",
            Mutation::RemoveAttribute { .. } => "remove_attribute",
            Mutation::Touch => "touch",
            Mutation::SetIdleTimeout { .. } => "set_idle_timeout",
            Mutation::Invalidate => "invalidate",
            Mutation::Sync { .. } => "sync",
        }
    }
}

/// Marker left behind when an entry is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tombstone {
    pub version: u64,
    pub removed_at: DateTime<Utc>,
}
