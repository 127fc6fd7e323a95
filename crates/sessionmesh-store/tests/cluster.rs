//! Multi-node integration tests.
//!
//! Every test runs several in-process nodes over a shared `LocalTransport`
//! and a shared manual clock.

mod common;

use std::time::Duration;

use anyhow::Result;
use common::{TestCluster, session_ids, test_config};
use sessionmesh_store::{
    ApplyOutcome, AttributeValue, BackupMode, ClusterView, Error, LocalTransport, MemberId,
    Mutation, SessionEntry, WriteOutcome,
};

fn value(s: &str) -> AttributeValue {
    AttributeValue::from(s)
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_read_from_any_node() -> Result<()> {
    let cluster = TestCluster::start(&["node-a", "node-b", "node-c"], test_config());
    let id = "session-shared";

    cluster.owner_of(id).store.put(id, "user", "alice").await?;

    for node in &cluster.nodes {
        let entry = node.store.get(id).await?;
        assert_eq!(entry.attribute("user"), Some(&value("alice")), "read via {}", node.id);
    }
    Ok(())
}

#[tokio::test]
async fn test_write_on_non_owner_without_forwarding() -> Result<()> {
    let cluster = TestCluster::start(&["node-a", "node-b", "node-c"], test_config());
    let id = "session-1";
    let owner = cluster.owner_of(id).id.clone();

    let err = cluster
        .bystander_of(id)
        .store
        .put(id, "k", "v")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::OwnerUnavailable { owner: Some(ref m), .. } if *m == owner));
    assert!(err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn test_write_on_non_owner_with_forwarding() -> Result<()> {
    let cluster = TestCluster::start_with_transport(
        &["node-a", "node-b", "node-c"],
        test_config(),
        LocalTransport::new().with_forwarding(true),
    );
    let id = "session-1";

    let outcome = cluster.bystander_of(id).store.put(id, "k", "v").await?;

    assert_eq!(outcome.version(), 1);
    let owned = cluster.owner_of(id).store.local_copy(id).expect("owner holds entry");
    assert_eq!(owned.attribute("k"), Some(&value("v")));
    assert!(cluster.bystander_of(id).store.local_copy(id).is_none());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Backups
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_backup_receives_owner_version() -> Result<()> {
    let cluster = TestCluster::start(&["node-a", "node-b", "node-c"], test_config());
    let id = "session-1";
    let owner = cluster.owner_of(id);

    owner.store.put(id, "a", "1").await?;
    let outcome = owner.store.put(id, "b", "2").await?;
    cluster.flush().await;

    let backup = cluster.backup_of(id).store.local_copy(id).expect("backup holds copy");
    assert_eq!(backup.version, outcome.version());
    assert_eq!(backup, owner.store.local_copy(id).expect("owner holds entry"));
    assert!(cluster.bystander_of(id).store.local_copy(id).is_none());
    Ok(())
}

#[tokio::test]
async fn test_read_falls_back_to_backup_when_owner_unreachable() -> Result<()> {
    let cluster = TestCluster::start(&["node-a", "node-b", "node-c"], test_config());
    let id = "session-1";
    let owner = cluster.owner_of(id);
    owner.store.put(id, "cart", "book").await?;
    cluster.flush().await;

    cluster.set_reachable(owner.id.as_str(), false);

    let entry = cluster.bystander_of(id).store.get(id).await?;
    assert_eq!(entry.attribute("cart"), Some(&value("book")));
    Ok(())
}

#[tokio::test]
async fn test_read_unavailable_when_no_replica_reachable() -> Result<()> {
    let cluster = TestCluster::start(&["node-a", "node-b", "node-c"], test_config());
    let id = "session-1";
    cluster.owner_of(id).store.put(id, "k", "v").await?;
    cluster.flush().await;

    cluster.set_reachable(cluster.owner_of(id).id.as_str(), false);
    cluster.set_reachable(cluster.backup_of(id).id.as_str(), false);

    let err = cluster.bystander_of(id).store.get(id).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)));
    Ok(())
}

#[tokio::test]
async fn test_read_not_found_when_replicas_answer_without_entry() -> Result<()> {
    let cluster = TestCluster::start(&["node-a", "node-b", "node-c"], test_config());
    let id = "session-missing";

    let err = cluster.bystander_of(id).store.get(id).await.unwrap_err();

    assert!(matches!(err, Error::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn test_sync_mode_reports_partial_failure() -> Result<()> {
    let config = test_config().with_backup_mode(BackupMode::Sync);
    let cluster = TestCluster::start(&["node-a", "node-b"], config);
    let id = "session-1";
    let owner = cluster.owner_of(id);
    let backup = cluster.backup_of(id).id.clone();

    cluster.set_reachable(backup.as_str(), false);
    let outcome = owner.store.put(id, "k", "v").await?;

    assert_eq!(
        outcome,
        WriteOutcome::PartialFailure {
            version: 1,
            failed: vec![backup],
        }
    );
    assert!(owner.store.local_copy(id).is_some());
    assert_eq!(owner.store.stats().counters.partial_failures, 1);
    Ok(())
}

#[tokio::test]
async fn test_sync_mode_acknowledges_when_backups_apply() -> Result<()> {
    let config = test_config().with_backup_mode(BackupMode::Sync);
    let cluster = TestCluster::start(&["node-a", "node-b"], config);
    let id = "session-1";

    let outcome = cluster.owner_of(id).store.put(id, "k", "v").await?;

    assert_eq!(
        outcome,
        WriteOutcome::Acknowledged {
            version: 1,
            backups: 1
        }
    );
    // No flush needed in sync mode.
    assert!(cluster.backup_of(id).store.local_copy(id).is_some());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Versioning
// ─────────────────────────────────────────────────────────────────────────────

fn snapshot(id: &str, content: &str, version: u64) -> Mutation {
    let mut entry = SessionEntry::new(id, chrono::Utc::now());
    entry.attributes.insert("k".into(), value(content));
    entry.version = version;
    Mutation::Sync { entry }
}

#[tokio::test]
async fn test_out_of_order_delivery_keeps_highest_version() -> Result<()> {
    let cluster = TestCluster::start(&["node-a", "node-b"], test_config());
    let replica = cluster.nodes[1].store.replication();

    let first = replica.apply_replicated("session-1", &snapshot("session-1", "five", 5), 5);
    let second = replica.apply_replicated("session-1", &snapshot("session-1", "three", 3), 3);

    assert_eq!(first, ApplyOutcome::Applied { version: 5 });
    assert_eq!(second, ApplyOutcome::Stale { local_version: 5 });
    let entry = replica.local_copy("session-1").expect("replica holds entry");
    assert_eq!(entry.version, 5);
    assert_eq!(entry.attribute("k"), Some(&value("five")));
    assert_eq!(replica.metrics().snapshot().stale_ignored, 1);
    Ok(())
}

#[tokio::test]
async fn test_redelivery_is_idempotent() -> Result<()> {
    let cluster = TestCluster::start(&["node-a", "node-b"], test_config());
    let replica = cluster.nodes[1].store.replication();
    let mutation = snapshot("session-1", "v", 4);

    replica.apply_replicated("session-1", &mutation, 4);
    let once = replica.local_copy("session-1");
    for _ in 0..5 {
        replica.apply_replicated("session-1", &mutation, 4);
    }

    assert_eq!(replica.local_copy("session-1"), once);
    Ok(())
}

#[tokio::test]
async fn test_remove_propagates_and_blocks_late_snapshot() -> Result<()> {
    let cluster = TestCluster::start(&["node-a", "node-b"], test_config());
    let id = "session-1";
    let owner = cluster.owner_of(id);
    let backup = cluster.backup_of(id);

    owner.store.put(id, "k", "v").await?;
    let removed = owner.store.remove(id).await?;
    cluster.flush().await;

    assert_eq!(removed.version(), 2);
    assert!(backup.store.local_copy(id).is_none());
    let late = backup
        .store
        .replication()
        .apply_replicated(id, &snapshot(id, "stale", 1), 1);
    assert_eq!(late, ApplyOutcome::Stale { local_version: 2 });
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Expiry and eviction
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_expiry_removes_backup_copy() -> Result<()> {
    let config = test_config().with_idle_timeout(Duration::from_secs(60));
    let cluster = TestCluster::start(&["node-a", "node-b"], config);
    let id = "session-1";
    let owner = cluster.owner_of(id);
    let backup = cluster.backup_of(id);
    owner.store.put(id, "k", "v").await?;
    cluster.flush().await;

    cluster.clock.advance(Duration::from_secs(61));
    assert!(matches!(owner.store.get(id).await, Err(Error::NotFound(_))));

    let report = owner.store.run_eviction().await;
    cluster.flush().await;

    assert_eq!(report.expired, 1);
    assert!(owner.store.replication().store().is_empty());
    assert!(backup.store.replication().store().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_orphaned_copy_dropped_after_grace() -> Result<()> {
    let config = test_config().with_idle_timeout(Duration::from_secs(60));
    let cluster = TestCluster::start(&["node-a", "node-b"], config);
    let id = "session-1";
    let owner = cluster.owner_of(id);
    let backup = cluster.backup_of(id);
    owner.store.put(id, "k", "v").await?;
    cluster.flush().await;

    // The owner never gets to send its delete.
    cluster.clock.advance(Duration::from_secs(90));
    assert_eq!(backup.store.run_eviction().await.orphans_dropped, 0);

    cluster.clock.advance(Duration::from_secs(40));
    assert_eq!(backup.store.run_eviction().await.orphans_dropped, 1);
    assert!(backup.store.replication().store().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_lru_keeps_most_recent_entries() -> Result<()> {
    let config = test_config().with_max_entries(2);
    let cluster = TestCluster::start(&["node-1"], config);
    let node = &cluster.nodes[0];

    for id in ["a", "b", "c"] {
        node.store.put(id, "k", "v").await?;
        cluster.clock.advance(Duration::from_secs(1));
    }

    assert!(node.store.local_copy("a").is_none());
    assert!(node.store.local_copy("b").is_some());
    assert!(node.store.local_copy("c").is_some());
    assert_eq!(node.store.active_entry_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_lru_spares_recently_read_entry() -> Result<()> {
    let config = test_config().with_max_entries(2);
    let cluster = TestCluster::start(&["node-1"], config);
    let node = &cluster.nodes[0];

    node.store.put("a", "k", "v").await?;
    cluster.clock.advance(Duration::from_secs(1));
    node.store.put("b", "k", "v").await?;
    cluster.clock.advance(Duration::from_secs(1));
    node.store.get("a").await?;
    cluster.clock.advance(Duration::from_secs(1));
    node.store.put("c", "k", "v").await?;

    assert!(node.store.local_copy("a").is_some());
    assert!(node.store.local_copy("b").is_none());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Membership
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_owner_loss_promotes_backup() -> Result<()> {
    let cluster = TestCluster::start(&["node-a", "node-b", "node-c"], test_config());
    let ids = session_ids(40);
    for id in &ids {
        cluster.owner_of(id).store.put(id, "k", id.as_str()).await?;
    }
    cluster.flush().await;

    cluster.set_reachable("node-a", false);
    let event = cluster.set_members(&["node-b", "node-c"]);
    cluster.rebalance(&event).await;
    cluster.flush().await;

    for id in &ids {
        let entry = cluster.node("node-b").store.get(id).await?;
        assert_eq!(entry.attribute("k"), Some(&value(id)), "lost {id}");
    }
    Ok(())
}

#[tokio::test]
async fn test_join_pushes_keys_to_new_member() -> Result<()> {
    let mut cluster = TestCluster::start(&["node-a", "node-b"], test_config());
    let ids = session_ids(60);
    for id in &ids {
        cluster.owner_of(id).store.put(id, "k", id.as_str()).await?;
    }
    cluster.flush().await;

    let members: Vec<MemberId> = ["node-a", "node-b", "node-c"]
        .iter()
        .map(|n| MemberId::from(*n))
        .collect();
    cluster.spawn_node("node-c", members);
    let event = cluster.set_members(&["node-a", "node-b", "node-c"]);
    let reports = cluster.rebalance(&event).await;

    let pushed: usize = reports.iter().map(|r| r.pushed).sum();
    assert!(pushed > 0);

    let joined = cluster.node("node-c");
    for id in &ids {
        let replicas = joined.view.replica_set(id);
        for node in &cluster.nodes {
            let held = node.store.local_copy(id).is_some();
            assert_eq!(held, replicas.contains(&node.id), "{id} on {}", node.id);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_failed_rebalance_push_retried_by_scan() -> Result<()> {
    let mut cluster = TestCluster::start(&["node-a", "node-b"], test_config());
    let ids = session_ids(30);
    for id in &ids {
        cluster.owner_of(id).store.put(id, "k", "v").await?;
    }
    cluster.flush().await;

    let members: Vec<MemberId> = ["node-a", "node-b", "node-c"]
        .iter()
        .map(|n| MemberId::from(*n))
        .collect();
    cluster.spawn_node("node-c", members);
    cluster.set_reachable("node-c", false);
    let event = cluster.set_members(&["node-a", "node-b", "node-c"]);
    let reports = cluster.rebalance(&event).await;
    let failed: usize = reports.iter().map(|r| r.failed).sum();
    assert!(failed > 0);

    cluster.set_reachable("node-c", true);
    let mut retried = 0;
    for name in ["node-a", "node-b"] {
        retried += cluster.node(name).store.run_eviction().await.retried;
    }

    assert_eq!(retried, failed);
    let joined = cluster.node("node-c");
    for id in &ids {
        if joined.view.replica_set(id).contains(&joined.id) {
            assert!(joined.store.local_copy(id).is_some(), "{id} missing on node-c");
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_background_listener_rebalances() -> Result<()> {
    let mut cluster = TestCluster::start(&["node-a", "node-b"], test_config());
    for node in &cluster.nodes {
        node.store.start_background_tasks();
    }
    let ids = session_ids(20);
    for id in &ids {
        cluster.owner_of(id).store.put(id, "k", "v").await?;
    }
    cluster.flush().await;

    let members: Vec<MemberId> = ["node-a", "node-b", "node-c"]
        .iter()
        .map(|n| MemberId::from(*n))
        .collect();
    cluster.spawn_node("node-c", members);
    cluster.set_members(&["node-a", "node-b", "node-c"]);

    let joined = cluster.node("node-c");
    let expected = ids
        .iter()
        .filter(|id| joined.view.replica_set(id).contains(&joined.id))
        .count();
    let mut held = 0;
    for _ in 0..100 {
        held = ids
            .iter()
            .filter(|id| joined.store.local_copy(id).is_some())
            .count();
        if held == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(held, expected);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrency
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_on_one_session() -> Result<()> {
    const WRITERS: usize = 32;
    let cluster = TestCluster::start_with_transport(
        &["node-a", "node-b", "node-c"],
        test_config(),
        LocalTransport::new().with_forwarding(true),
    );
    let id = "session-hot";

    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let store = cluster.nodes[i % cluster.nodes.len()].store.clone();
            tokio::spawn(async move { store.put(id, format!("attr-{i}"), "v").await })
        })
        .collect();
    for handle in handles {
        handle.await??;
    }
    cluster.flush().await;

    let owned = cluster.owner_of(id).store.local_copy(id).expect("owner holds entry");
    assert_eq!(owned.version, WRITERS as u64);
    for i in 0..WRITERS {
        assert_eq!(owned.attribute(&format!("attr-{i}")), Some(&value("v")), "attr-{i}");
    }
    let backup = cluster.backup_of(id).store.local_copy(id).expect("backup holds entry");
    assert_eq!(backup.version, WRITERS as u64);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_eviction_scan_runs_alongside_touches() -> Result<()> {
    const ROUNDS: u64 = 5;
    let cluster = TestCluster::start(
        &["node-a"],
        test_config().with_idle_timeout(Duration::from_secs(60)),
    );
    let node = &cluster.nodes[0];

    let stale: Vec<String> = (0..100).map(|i| format!("stale-{i}")).collect();
    for id in &stale {
        node.store.put(id, "k", "v").await?;
    }
    cluster.clock.advance(Duration::from_secs(61));
    let fresh = session_ids(100);
    for id in &fresh {
        node.store.put(id, "k", "v").await?;
    }

    let toucher = {
        let store = node.store.clone();
        let fresh = fresh.clone();
        tokio::spawn(async move {
            for _ in 0..ROUNDS {
                for id in &fresh {
                    store.touch(id).await?;
                }
            }
            Ok::<_, Error>(())
        })
    };
    let mut expired = 0;
    for _ in 0..ROUNDS {
        expired += node.store.run_eviction().await.expired;
        tokio::task::yield_now().await;
    }
    toucher.await??;

    assert_eq!(expired, stale.len());
    assert_eq!(node.store.active_entry_count(), fresh.len());
    for id in &fresh {
        let entry = node.store.local_copy(id).expect("touched entry survives");
        assert_eq!(entry.version, 1 + ROUNDS, "{id}");
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stats_across_cluster() -> Result<()> {
    let cluster = TestCluster::start(&["node-a", "node-b"], test_config());
    let ids = session_ids(10);
    for id in &ids {
        cluster.owner_of(id).store.put(id, "k", "v").await?;
    }
    cluster.flush().await;

    let owned: usize = cluster
        .nodes
        .iter()
        .map(|n| n.store.stats().owned_entries)
        .sum();
    for node in &cluster.nodes {
        let stats = node.store.stats();
        assert_eq!(stats.cluster_size, 2);
        assert_eq!(stats.active_entries, 10);
        assert!(stats.healthy);
    }
    assert_eq!(owned, 10);

    cluster.nodes[0].view.set_running(false);
    assert!(!cluster.nodes[0].store.is_healthy());
    Ok(())
}

#[tokio::test]
async fn test_counters_record_where_operation_is_served() -> Result<()> {
    let cluster = TestCluster::start_with_transport(
        &["node-a", "node-b", "node-c"],
        test_config(),
        LocalTransport::new().with_forwarding(true),
    );
    let id = "session-1";
    let bystander = cluster.bystander_of(id);

    bystander.store.put(id, "k", "v").await?;
    bystander.store.get(id).await?;
    cluster.flush().await;

    let total_writes: u64 = cluster.nodes.iter().map(|n| n.store.stats().counters.writes).sum();
    let total_reads: u64 = cluster.nodes.iter().map(|n| n.store.stats().counters.reads).sum();
    assert_eq!(total_writes, 1);
    assert_eq!(total_reads, 1);

    let owner = cluster.owner_of(id).store.stats().counters;
    assert_eq!((owner.writes, owner.reads), (1, 1));
    let forwarder = bystander.store.stats().counters;
    assert_eq!((forwarder.writes, forwarder.reads, forwarder.forwarded), (0, 0, 1));
    Ok(())
}

#[tokio::test]
async fn test_session_listing_partitions_by_owner() -> Result<()> {
    let cluster = TestCluster::start(&["node-a", "node-b", "node-c"], test_config());
    let ids = session_ids(20);
    for id in &ids {
        cluster.owner_of(id).store.put(id, "k", "v").await?;
    }
    cluster.flush().await;

    let mut listed: Vec<String> = cluster
        .nodes
        .iter()
        .flat_map(|n| n.store.session_ids())
        .collect();
    listed.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(listed, expected);

    let held: usize = cluster.nodes.iter().map(|n| n.store.local_sessions().len()).sum();
    assert_eq!(held, ids.len() * (1 + cluster.config.backup_count));
    Ok(())
}
