//! Per-key concurrent entry storage.
//!
//! [`EntryStore`] holds the physical entries of one node. Reads are public;
//! every mutating method is crate-private so that version stamping only ever
//! happens on behalf of the [`crate::ReplicationManager`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, trace};

use crate::clock::{SharedClock, to_delta};
use crate::entry::{AttributeValue, Mutation, SessionEntry, Tombstone};
use crate::error::{Error, Result};
use crate::expiry::ExpiryPolicy;

/// Result of removing an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The entry was removed; `version` is the removal's version.
    Removed { version: u64 },
    /// No live entry existed.
    NotFound,
}

/// Result of updating an existing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The entry as it stands after the update.
    Updated(SessionEntry),
    /// No live entry existed.
    NotFound,
}

impl UpdateOutcome {
    /// Post-update version, if the entry existed.
    pub fn version(&self) -> Option<u64> {
        match self {
            UpdateOutcome::Updated(entry) => Some(entry.version),
            UpdateOutcome::NotFound => None,
        }
    }
}

/// Result of applying a replicated mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ApplyOutcome {
    /// The mutation was applied at `version`.
    Applied { version: u64 },
    /// The local replica already holds `local_version >= version`.
    Stale { local_version: u64 },
    /// A partial mutation arrived for an entry this replica does not hold.
    Missing,
}

/// State after an owner-side mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Applied {
    /// The entry exists with this post-mutation state.
    Updated(SessionEntry),
    /// The entry was removed at `version`.
    Removed { version: u64 },
}

impl Applied {
    pub(crate) fn version(&self) -> u64 {
        match self {
            Applied::Updated(entry) => entry.version,
            Applied::Removed { version } => *version,
        }
    }
}

/// An entry selected for removal, with the state it was selected in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Session identifier.
    pub id: String,
    /// Version observed at selection time.
    pub version: u64,
    /// Access time observed at selection time.
    pub last_accessed_at: DateTime<Utc>,
}

impl Candidate {
    fn of(entry: &SessionEntry) -> Self {
        Self {
            id: entry.id.clone(),
            version: entry.version,
            last_accessed_at: entry.last_accessed_at,
        }
    }
}

/// In-memory entry storage for one node.
pub struct EntryStore {
    /// Live and not-yet-swept entries.
    entries: DashMap<String, SessionEntry>,

    /// Removal markers that reject stale replicated writes.
    tombstones: DashMap<String, Tombstone>,

    /// Idle/TTL rules.
    policy: ExpiryPolicy,

    /// Whether reads refresh the idle timer.
    touch_on_read: bool,

    /// Time source.
    clock: SharedClock,
}

impl EntryStore {
    /// Create an empty store.
    pub fn new(policy: ExpiryPolicy, touch_on_read: bool, clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            tombstones: DashMap::new(),
            policy,
            touch_on_read,
            clock,
        }
    }

    /// Expiry rules in force.
    pub fn policy(&self) -> &ExpiryPolicy {
        &self.policy
    }

    /// Time source.
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Whether reads refresh the idle timer.
    pub fn touches_on_read(&self) -> bool {
        self.touch_on_read
    }

    /// Number of physically present entries, including expired ones
    /// awaiting a sweep.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are physically present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries that are not logically expired.
    pub fn live_count(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|e| !self.policy.is_expired(e.value(), now))
            .count()
    }

    /// Number of tombstones currently held.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Whether a live entry exists.
    pub fn contains(&self, id: &str) -> bool {
        self.peek(id).is_some()
    }

    /// Highest version known locally for `id` (entry or tombstone).
    pub fn version_of(&self, id: &str) -> u64 {
        if let Some(entry) = self.entries.get(id) {
            return entry.version;
        }
        self.tombstones.get(id).map(|t| t.version).unwrap_or(0)
    }

    /// Read a live entry without touching it.
    pub fn peek(&self, id: &str) -> Option<SessionEntry> {
        let now = self.clock.now();
        self.entries
            .get(id)
            .filter(|e| !self.policy.is_expired(e.value(), now))
            .map(|e| e.value().clone())
    }

    /// Snapshot of every live entry.
    pub fn snapshot(&self) -> Vec<SessionEntry> {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|e| !self.policy.is_expired(e.value(), now))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Ids of entries that are expired as of this call.
    ///
    /// Shards are read-locked one at a time, so concurrent writers are never
    /// blocked for the whole scan. An id returned here may have been touched
    /// since; consumers must re-validate before removing.
    pub fn scan_expirable(&self) -> std::vec::IntoIter<Candidate> {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|e| self.policy.is_expired(e.value(), now))
            .map(|e| Candidate::of(e.value()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Live entries accepted by `include`, least recently accessed first.
    ///
    /// Ties are broken by ascending id.
    pub fn lru_candidates(&self, include: impl Fn(&str) -> bool) -> Vec<Candidate> {
        let now = self.clock.now();
        let mut candidates: Vec<Candidate> = self
            .entries
            .iter()
            .filter(|e| !self.policy.is_expired(e.value(), now) && include(e.key()))
            .map(|e| Candidate::of(e.value()))
            .collect();
        candidates.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates
    }

    /// Read a live entry, touching it when touch-on-read is enabled.
    pub(crate) fn get(&self, id: &str) -> Result<SessionEntry> {
        let now = self.clock.now();
        let Some(mut entry) = self.entries.get_mut(id) else {
            return Err(Error::NotFound(id.to_string()));
        };
        if self.policy.is_expired(&entry, now) {
            trace!(session_id = %id, "Entry expired, hiding from read");
            return Err(Error::NotFound(id.to_string()));
        }
        if self.touch_on_read {
            entry.touch(now);
            entry.version += 1;
        }
        Ok(entry.clone())
    }

    /// Set one attribute, creating the entry if needed.
    pub(crate) fn put(
        &self,
        id: &str,
        name: impl Into<String>,
        value: AttributeValue,
    ) -> SessionEntry {
        let name = name.into();
        self.upsert(id, "set_attribute", |entry, now| {
            entry.attributes.insert(name, value);
            entry.touch(now);
        })
    }

    /// Remove one attribute from a live entry. An absent attribute still
    /// counts as an access.
    pub(crate) fn remove_attribute(&self, id: &str, name: &str) -> UpdateOutcome {
        let removed = self.update(id, "remove_attribute", |entry, now| {
            entry.attributes.remove(name);
            entry.touch(now);
        });
        match removed {
            Ok(entry) => UpdateOutcome::Updated(entry),
            Err(_) => UpdateOutcome::NotFound,
        }
    }

    /// Remove a live entry, leaving a tombstone one version above it.
    pub(crate) fn remove(&self, id: &str) -> RemoveOutcome {
        let now = self.clock.now();
        let Some((_, removed)) = self
            .entries
            .remove_if(id, |_, e| !self.policy.is_expired(e, now))
        else {
            return RemoveOutcome::NotFound;
        };
        let version = removed.version + 1;
        self.bury(id, version, now);
        debug!(session_id = %id, version, "Entry removed");
        RemoveOutcome::Removed { version }
    }

    /// Apply a mutation as the owner, stamping the next version.
    pub(crate) fn apply(&self, id: &str, mutation: &Mutation) -> Result<Applied> {
        match mutation {
            Mutation::SetAttribute { name, value } => {
                Ok(Applied::Updated(self.put(id, name.clone(), value.clone())))
            }
            Mutation::RemoveAttribute { name } => match self.remove_attribute(id, name) {
                UpdateOutcome::Updated(entry) => Ok(Applied::Updated(entry)),
                UpdateOutcome::NotFound => Err(Error::NotFound(id.to_string())),
            },
            Mutation::Invalidate => match self.remove(id) {
                RemoveOutcome::Removed { version } => Ok(Applied::Removed { version }),
                RemoveOutcome::NotFound => Err(Error::NotFound(id.to_string())),
            },
            Mutation::Sync { .. } => Ok(Applied::Updated(self.upsert(
                id,
                mutation.kind(),
                |entry, now| entry.apply(mutation, now),
            ))),
            Mutation::Touch | Mutation::SetIdleTimeout { .. } => self
                .update(id, mutation.kind(), |entry, now| entry.apply(mutation, now))
                .map(Applied::Updated),
        }
    }

    /// Change a live entry in place and stamp the next version.
    fn update(
        &self,
        id: &str,
        op: &'static str,
        change: impl FnOnce(&mut SessionEntry, DateTime<Utc>),
    ) -> Result<SessionEntry> {
        let now = self.clock.now();
        let Some(mut entry) = self.entries.get_mut(id) else {
            return Err(Error::NotFound(id.to_string()));
        };
        if self.policy.is_expired(&entry, now) {
            return Err(Error::NotFound(id.to_string()));
        }
        change(entry.value_mut(), now);
        entry.version += 1;
        trace!(session_id = %id, version = entry.version, op, "Entry updated");
        Ok(entry.clone())
    }

    /// Change an entry, creating it if absent; an expired or removed
    /// predecessor is replaced by a fresh entry whose version continues
    /// above it.
    fn upsert(
        &self,
        id: &str,
        op: &'static str,
        change: impl FnOnce(&mut SessionEntry, DateTime<Utc>),
    ) -> SessionEntry {
        let now = self.clock.now();
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if self.policy.is_expired(entry, now) {
                    let mut fresh = SessionEntry::new(id, now);
                    fresh.version = entry.version;
                    *entry = fresh;
                }
                change(&mut *entry, now);
                entry.version += 1;
                trace!(session_id = %id, version = entry.version, op, "Entry updated");
                entry.clone()
            }
            Entry::Vacant(vacant) => {
                let base = self
                    .tombstones
                    .remove(id)
                    .map(|(_, t)| t.version)
                    .unwrap_or(0);
                let mut entry = SessionEntry::new(id, now);
                entry.version = base;
                change(&mut entry, now);
                entry.version += 1;
                debug!(session_id = %id, version = entry.version, op, "Entry created");
                vacant.insert(entry).clone()
            }
        }
    }

    /// Apply a mutation received from the owner.
    ///
    /// Only versions strictly above the local version (or tombstone) are
    /// applied, which makes re-delivery a no-op.
    pub(crate) fn apply_replicated(
        &self,
        id: &str,
        mutation: &Mutation,
        version: u64,
    ) -> ApplyOutcome {
        let now = self.clock.now();
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let local_version = occupied.get().version;
                if version <= local_version {
                    return ApplyOutcome::Stale { local_version };
                }
                match mutation {
                    Mutation::Invalidate => {
                        occupied.remove();
                        self.tombstones.insert(
                            id.to_string(),
                            Tombstone {
                                version,
                                removed_at: now,
                            },
                        );
                    }
                    Mutation::Sync { entry } => {
                        let mut replica = entry.clone();
                        replica.id = id.to_string();
                        replica.version = version;
                        *occupied.get_mut() = replica;
                    }
                    other => {
                        let entry = occupied.get_mut();
                        entry.apply(other, now);
                        entry.version = version;
                    }
                }
                ApplyOutcome::Applied { version }
            }
            Entry::Vacant(vacant) => {
                let tombstone = self.tombstones.get(id).map(|t| t.version);
                if let Some(local_version) = tombstone
                    && version <= local_version
                {
                    return ApplyOutcome::Stale { local_version };
                }
                let replica = match mutation {
                    Mutation::Invalidate => {
                        self.tombstones.insert(
                            id.to_string(),
                            Tombstone {
                                version,
                                removed_at: now,
                            },
                        );
                        return ApplyOutcome::Applied { version };
                    }
                    Mutation::Sync { entry } => {
                        let mut replica = entry.clone();
                        replica.id = id.to_string();
                        replica
                    }
                    Mutation::SetAttribute { .. } => {
                        let mut replica = SessionEntry::new(id, now);
                        replica.apply(mutation, now);
                        replica
                    }
                    _ => return ApplyOutcome::Missing,
                };
                self.tombstones.remove(id);
                let mut replica = replica;
                replica.version = version;
                vacant.insert(replica);
                ApplyOutcome::Applied { version }
            }
        }
    }

    /// Remove `id` only if it is still expired. Leaves a tombstone one
    /// version above the removed entry.
    pub(crate) fn remove_if_expired(&self, id: &str) -> Option<SessionEntry> {
        let now = self.clock.now();
        let removed = self
            .entries
            .remove_if(id, |_, e| self.policy.is_expired(e, now))
            .map(|(_, e)| e)?;
        self.bury(id, removed.version + 1, now);
        Some(removed)
    }

    /// Remove `id` only if it is still at `version`, i.e. untouched since
    /// it was selected.
    pub(crate) fn remove_if_version(&self, id: &str, version: u64) -> Option<SessionEntry> {
        let now = self.clock.now();
        let removed = self
            .entries
            .remove_if(id, |_, e| e.version == version)
            .map(|(_, e)| e)?;
        self.bury(id, removed.version + 1, now);
        Some(removed)
    }

    /// Drop a non-authoritative copy that has been expired for longer than
    /// `grace`. The tombstone keeps the copy's own version.
    pub(crate) fn remove_orphan(&self, id: &str, grace: Duration) -> Option<SessionEntry> {
        let now = self.clock.now();
        let removed = self
            .entries
            .remove_if(id, |_, e| {
                self.policy
                    .expired_for(e, now)
                    .is_some_and(|expired| expired > grace)
            })
            .map(|(_, e)| e)?;
        self.bury(id, removed.version, now);
        Some(removed)
    }

    /// Drop a local copy this node no longer replicates, if unchanged.
    pub(crate) fn release(&self, id: &str, version: u64) -> bool {
        let now = self.clock.now();
        match self.entries.remove_if(id, |_, e| e.version == version) {
            Some(_) => {
                self.bury(id, version, now);
                true
            }
            None => false,
        }
    }

    /// Purge tombstones older than `retention`. Returns how many were purged.
    pub(crate) fn purge_tombstones(&self, retention: Duration) -> usize {
        let now = self.clock.now();
        let retention = to_delta(retention);
        let before = self.tombstones.len();
        self.tombstones
            .retain(|_, t| now.signed_duration_since(t.removed_at) < retention);
        before.saturating_sub(self.tombstones.len())
    }

    fn bury(&self, id: &str, version: u64, now: DateTime<Utc>) {
        self.tombstones
            .entry(id.to_string())
            .and_modify(|t| {
                if version > t.version {
                    t.version = version;
                    t.removed_at = now;
                }
            })
            .or_insert(Tombstone {
                version,
                removed_at: now,
            });
    }
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("entries", &self.entries.len())
            .field("tombstones", &self.tombstones.len())
            .field("policy", &self.policy)
            .field("touch_on_read", &self.touch_on_read)
            .finish()
    }
}
