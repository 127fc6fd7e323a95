//! Idle/TTL expiry and size-bound LRU eviction.
//!
//! The engine selects candidates from a snapshot and removes each one only
//! after re-validating it, so an entry touched between selection and removal
//! survives. Owned entries are removed through the replication delete path;
//! failures are left for the next scan and never surface to callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::replication::ReplicationManager;
use crate::stats::Metrics;

/// Scan state of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionState {
    Idle,
    Scanning,
}

/// What one scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionReport {
    /// Owned entries removed for idle timeout or TTL.
    pub expired: usize,
    /// Owned entries removed to respect the size bound.
    pub evicted: usize,
    /// Expired non-owned copies dropped locally.
    pub orphans_dropped: usize,
    /// Tombstones purged.
    pub tombstones_purged: usize,
    /// Candidates skipped because they changed after selection.
    pub skipped: usize,
    /// Pending rebalance pushes that went through on retry.
    pub retried: usize,
}

impl EvictionReport {
    /// Total entries removed.
    pub fn removed(&self) -> usize {
        self.expired + self.evicted + self.orphans_dropped
    }
}

/// Eviction engine for one node.
#[derive(Debug)]
pub struct EvictionEngine {
    scanning: AtomicBool,
    max_entries: usize,
    /// How long a non-owned copy may stay expired before it is dropped.
    orphan_grace: Duration,
    tombstone_retention: Duration,
}

impl EvictionEngine {
    /// Create an engine bounding owned entries to `max_entries`.
    pub fn new(max_entries: usize, idle_timeout: Duration) -> Self {
        Self {
            scanning: AtomicBool::new(false),
            max_entries,
            orphan_grace: idle_timeout,
            tombstone_retention: idle_timeout,
        }
    }

    /// Current state.
    pub fn state(&self) -> EvictionState {
        if self.scanning.load(Ordering::SeqCst) {
            EvictionState::Scanning
        } else {
            EvictionState::Idle
        }
    }

    /// Owned-entry bound.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Run one full scan. Returns an empty report if a scan is already running.
    pub async fn scan(&self, manager: &ReplicationManager) -> EvictionReport {
        let Some(_guard) = ScanGuard::acquire(&self.scanning) else {
            debug!("Eviction scan already in progress, skipping");
            return EvictionReport::default();
        };

        let mut report = EvictionReport::default();
        let store = manager.store();

        for candidate in store.scan_expirable() {
            if manager.cluster().is_local_owner(&candidate.id) {
                if manager.expire_owned(&candidate.id).await {
                    report.expired += 1;
                } else {
                    report.skipped += 1;
                }
            } else if manager.drop_orphan(&candidate.id, self.orphan_grace) {
                report.orphans_dropped += 1;
            }
        }

        self.evict_lru(manager, &mut report).await;
        report.tombstones_purged = store.purge_tombstones(self.tombstone_retention);
        report.retried = manager.retry_pending().await;

        let metrics = manager.metrics();
        Metrics::add(&metrics.orphans_dropped, report.orphans_dropped as u64);

        if report.removed() > 0 || report.skipped > 0 {
            info!(
                expired = report.expired,
                evicted = report.evicted,
                orphans_dropped = report.orphans_dropped,
                skipped = report.skipped,
                tombstones_purged = report.tombstones_purged,
                "Eviction scan complete"
            );
        } else {
            debug!(tombstones_purged = report.tombstones_purged, "Eviction scan found nothing to remove");
        }

        report
    }

    /// Evict least-recently-accessed owned entries until the bound holds.
    ///
    /// Called from the write path after a creating write.
    pub(crate) async fn evict_overflow(&self, manager: &ReplicationManager) -> EvictionReport {
        let mut report = EvictionReport::default();
        self.evict_lru(manager, &mut report).await;
        report
    }

    async fn evict_lru(&self, manager: &ReplicationManager, report: &mut EvictionReport) {
        let cluster = manager.cluster();
        let candidates = manager
            .store()
            .lru_candidates(|id| cluster.is_local_owner(id));
        if candidates.len() <= self.max_entries {
            return;
        }

        let excess = candidates.len() - self.max_entries;
        debug!(
            owned = candidates.len(),
            max_entries = self.max_entries,
            excess,
            "Owned entries over bound"
        );
        for candidate in candidates.into_iter().take(excess) {
            if manager.evict_owned(&candidate.id, candidate.version).await {
                report.evicted += 1;
            } else {
                report.skipped += 1;
            }
        }
    }
}

/// Holds the scanning flag for the lifetime of one scan.
struct ScanGuard<'a>(&'a AtomicBool);

impl<'a> ScanGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_excludes_second_scan() {
        let engine = EvictionEngine::new(10, Duration::from_secs(60));

        let first = ScanGuard::acquire(&engine.scanning);
        assert!(first.is_some());
        assert_eq!(engine.state(), EvictionState::Scanning);
        assert!(ScanGuard::acquire(&engine.scanning).is_none());

        drop(first);
        assert_eq!(engine.state(), EvictionState::Idle);
    }

    #[test]
    fn test_report_totals() {
        let report = EvictionReport {
            expired: 2,
            evicted: 1,
            orphans_dropped: 3,
            ..Default::default()
        };
        assert_eq!(report.removed(), 6);
    }
}
