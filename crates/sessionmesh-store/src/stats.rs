//! Counters and the read-only stats/health facade.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterView, MemberId};
use crate::eviction::EvictionState;
use crate::store::EntryStore;

/// Operation counters for one node.
#[derive(Debug, Default)]
pub struct Metrics {
    pub(crate) writes: AtomicU64,
    pub(crate) reads: AtomicU64,
    pub(crate) forwarded: AtomicU64,
    pub(crate) replicated_applied: AtomicU64,
    pub(crate) stale_ignored: AtomicU64,
    pub(crate) expired: AtomicU64,
    pub(crate) evicted: AtomicU64,
    pub(crate) orphans_dropped: AtomicU64,
    pub(crate) partial_failures: AtomicU64,
    pub(crate) rebalance_pushes: AtomicU64,
}

impl Metrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            writes: load(&self.writes),
            reads: load(&self.reads),
            forwarded: load(&self.forwarded),
            replicated_applied: load(&self.replicated_applied),
            stale_ignored: load(&self.stale_ignored),
            expired: load(&self.expired),
            evicted: load(&self.evicted),
            orphans_dropped: load(&self.orphans_dropped),
            partial_failures: load(&self.partial_failures),
            rebalance_pushes: load(&self.rebalance_pushes),
        }
    }
}

/// Serializable counter values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Writes applied here as owner, including forwarded ones.
    pub writes: u64,
    /// Reads answered from the local copy, for local callers or peers.
    pub reads: u64,
    /// Writes this node handed to a remote owner.
    pub forwarded: u64,
    pub replicated_applied: u64,
    pub stale_ignored: u64,
    pub expired: u64,
    pub evicted: u64,
    pub orphans_dropped: u64,
    /// Backup pushes dropped after exhausting the retry budget.
    pub partial_failures: u64,
    pub rebalance_pushes: u64,
}

/// Statistics for one node, for monitoring collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// This node.
    pub local_member: MemberId,
    /// Members in the cluster view.
    pub cluster_size: usize,
    /// Live entries held locally (owned and backup copies).
    pub active_entries: usize,
    /// Live entries this node owns.
    pub owned_entries: usize,
    /// Live entries held as a backup.
    pub backup_entries: usize,
    /// Physically present entries, including expired ones awaiting a sweep.
    pub stored_entries: usize,
    /// Removal markers currently held.
    pub tombstones: usize,
    /// Whether the node is healthy.
    pub healthy: bool,
    /// Eviction engine state when the stats were taken.
    pub eviction: EvictionState,
    /// Operation counters.
    pub counters: MetricsSnapshot,
}

/// Read-only view over a node's store, cluster view and counters.
pub struct StatsFacade<'a> {
    store: &'a EntryStore,
    cluster: &'a dyn ClusterView,
    metrics: &'a Metrics,
    eviction: EvictionState,
}

impl<'a> StatsFacade<'a> {
    pub(crate) fn new(
        store: &'a EntryStore,
        cluster: &'a dyn ClusterView,
        metrics: &'a Metrics,
        eviction: EvictionState,
    ) -> Self {
        Self {
            store,
            cluster,
            metrics,
            eviction,
        }
    }

    /// Number of members in the cluster view.
    pub fn cluster_size(&self) -> usize {
        self.cluster.members().len()
    }

    /// Live entries held locally.
    pub fn active_entry_count(&self) -> usize {
        self.store.live_count()
    }

    /// Running member of a non-empty cluster.
    pub fn is_healthy(&self) -> bool {
        self.cluster.is_running() && self.cluster_size() >= 1
    }

    /// Full statistics.
    pub fn stats(&self) -> StoreStats {
        let local = self.cluster.local_member_id();
        let live = self.store.snapshot();
        let owned = live
            .iter()
            .filter(|e| self.cluster.owner(&e.id).as_ref() == Some(&local))
            .count();

        StoreStats {
            cluster_size: self.cluster_size(),
            active_entries: live.len(),
            owned_entries: owned,
            backup_entries: live.len() - owned,
            stored_entries: self.store.len(),
            tombstones: self.store.tombstone_count(),
            healthy: self.is_healthy(),
            eviction: self.eviction,
            counters: self.metrics.snapshot(),
            local_member: local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster::StaticClusterView;
    use crate::entry::AttributeValue;
    use crate::expiry::ExpiryPolicy;
    use std::sync::Arc;
    use std::time::Duration;

    fn store(clock: &ManualClock) -> EntryStore {
        EntryStore::new(
            ExpiryPolicy::new(Duration::from_secs(60), None),
            true,
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn test_health_follows_running_flag() {
        let clock = ManualClock::starting_now();
        let store = store(&clock);
        let view = StaticClusterView::single("a");
        let metrics = Metrics::new();

        let facade = StatsFacade::new(&store, &view, &metrics, EvictionState::Idle);
        assert!(facade.is_healthy());

        view.set_running(false);
        assert!(!facade.is_healthy());
    }

    #[test]
    fn test_empty_cluster_is_unhealthy() {
        let clock = ManualClock::starting_now();
        let store = store(&clock);
        let view = StaticClusterView::new("a", Vec::new(), 1);
        let metrics = Metrics::new();

        let facade = StatsFacade::new(&store, &view, &metrics, EvictionState::Idle);

        assert_eq!(facade.cluster_size(), 0);
        assert!(!facade.is_healthy());
    }

    #[test]
    fn test_stats_split_owned_and_backup() {
        let clock = ManualClock::starting_now();
        let store = store(&clock);
        let view = StaticClusterView::single("a");
        let metrics = Metrics::new();
        store.put("s-1", "k", AttributeValue::from("v"));
        store.put("s-2", "k", AttributeValue::from("v"));
        Metrics::incr(&metrics.writes);

        let stats = StatsFacade::new(&store, &view, &metrics, EvictionState::Idle).stats();

        assert_eq!(stats.active_entries, 2);
        assert_eq!(stats.owned_entries, 2);
        assert_eq!(stats.backup_entries, 0);
        assert_eq!(stats.counters.writes, 1);
        assert_eq!(stats.local_member, MemberId::from("a"));
    }

    #[test]
    fn test_stats_serialize() {
        let clock = ManualClock::starting_now();
        let store = store(&clock);
        let view = StaticClusterView::single("a");
        let metrics = Metrics::new();

        let stats = StatsFacade::new(&store, &view, &metrics, EvictionState::Idle).stats();
        let json = serde_json::to_value(&stats).unwrap();

        assert_eq!(json["cluster_size"], 1);
        assert_eq!(json["eviction"], "idle");
    }
}
