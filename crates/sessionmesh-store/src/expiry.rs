//! Idle-timeout and absolute-TTL evaluation.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::to_delta;
use crate::entry::SessionEntry;

/// Expiry rules shared by the entry store and the eviction engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    /// Default idle timeout (entries may override it).
    idle_timeout: Duration,

    /// Absolute lifetime from creation (None means no limit).
    time_to_live: Option<Duration>,
}

impl ExpiryPolicy {
    /// Create a policy.
    pub fn new(idle_timeout: Duration, time_to_live: Option<Duration>) -> Self {
        Self {
            idle_timeout,
            time_to_live,
        }
    }

    /// Default idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Absolute lifetime, if any.
    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }

    /// Instant at which the entry expires, whichever rule fires first.
    ///
    /// Returns `None` only if both deadlines overflow the calendar.
    pub fn expires_at(&self, entry: &SessionEntry) -> Option<DateTime<Utc>> {
        let idle = entry
            .last_accessed_at
            .checked_add_signed(to_delta(entry.idle_timeout(self.idle_timeout)));
        let absolute = self
            .time_to_live
            .and_then(|ttl| entry.created_at.checked_add_signed(to_delta(ttl)));

        match (idle, absolute) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Whether the entry is logically expired at `now`.
    pub fn is_expired(&self, entry: &SessionEntry, now: DateTime<Utc>) -> bool {
        self.expires_at(entry).is_some_and(|deadline| deadline <= now)
    }

    /// How long the entry has been expired, or `None` if still live.
    pub fn expired_for(&self, entry: &SessionEntry, now: DateTime<Utc>) -> Option<Duration> {
        let deadline = self.expires_at(entry)?;
        if deadline > now {
            return None;
        }
        (now - deadline).to_std().ok()
    }
}
