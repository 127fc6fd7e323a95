//! Common test utilities for multi-node integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sessionmesh_store::{
    ClusterView, LocalTransport, ManualClock, MemberId, MembershipEvent, RebalanceReport, SessionStore,
    StaticClusterView, StoreConfig,
};

/// One in-process node.
pub struct TestNode {
    /// The node's member id.
    pub id: MemberId,
    /// The node's cluster view.
    pub view: Arc<StaticClusterView>,
    /// The node's store.
    pub store: SessionStore,
}

/// Several nodes sharing one transport and one manual clock.
pub struct TestCluster {
    /// Shared in-process transport.
    pub transport: Arc<LocalTransport>,
    /// Shared clock.
    pub clock: ManualClock,
    /// Configuration every node was built with.
    pub config: StoreConfig,
    /// Nodes in creation order.
    pub nodes: Vec<TestNode>,
}

/// Configuration with fast retries and no background scan.
pub fn test_config() -> StoreConfig {
    StoreConfig::default()
        .with_retries(1, Duration::from_millis(1))
        .with_send_timeout(Duration::from_millis(200))
        .with_operation_timeout(Duration::from_secs(2))
        .with_eviction_task(false)
}

impl TestCluster {
    /// Start a cluster of `names` without write forwarding.
    pub fn start(names: &[&str], config: StoreConfig) -> Self {
        Self::start_with_transport(names, config, LocalTransport::new())
    }

    /// Start a cluster of `names` over the given transport.
    pub fn start_with_transport(
        names: &[&str],
        config: StoreConfig,
        transport: LocalTransport,
    ) -> Self {
        let mut cluster = Self {
            transport: Arc::new(transport),
            clock: ManualClock::starting_now(),
            config,
            nodes: Vec::new(),
        };
        let members: Vec<MemberId> = names.iter().map(|n| MemberId::from(*n)).collect();
        for name in names {
            cluster.spawn_node(name, members.clone());
        }
        cluster
    }

    /// Build and register a node that sees `members`.
    pub fn spawn_node(&mut self, name: &str, members: Vec<MemberId>) -> &TestNode {
        let id = MemberId::from(name);
        let view = Arc::new(StaticClusterView::new(
            id.clone(),
            members,
            self.config.backup_count,
        ));
        let store = SessionStore::builder()
            .config(self.config.clone())
            .cluster(view.clone())
            .transport(self.transport.clone())
            .clock(Arc::new(self.clock.clone()))
            .build();
        self.transport.register(id.clone(), store.replication());
        self.nodes.push(TestNode { id, view, store });
        self.nodes.last().expect("node was just pushed")
    }

    /// Node by name.
    pub fn node(&self, name: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id.as_str() == name)
            .unwrap_or_else(|| panic!("no node named {name}"))
    }

    /// Owner of `id` as seen by the first node.
    pub fn owner_of(&self, id: &str) -> &TestNode {
        let owner = self.nodes[0].view.owner(id).expect("cluster has an owner");
        self.node(owner.as_str())
    }

    /// First backup of `id` as seen by the first node.
    pub fn backup_of(&self, id: &str) -> &TestNode {
        let backups = self.nodes[0].view.backups(id);
        self.node(backups[0].as_str())
    }

    /// A node outside the replica set of `id`.
    pub fn bystander_of(&self, id: &str) -> &TestNode {
        let replicas = self.nodes[0].view.replica_set(id);
        self.nodes
            .iter()
            .find(|n| !replicas.contains(&n.id))
            .expect("cluster has a node outside the replica set")
    }

    /// Wait for every node's queued backup pushes.
    pub async fn flush(&self) {
        for node in &self.nodes {
            node.store.flush().await;
        }
    }

    /// Replace the member list on every node's view.
    pub fn set_members(&self, names: &[&str]) -> MembershipEvent {
        let members: Vec<MemberId> = names.iter().map(|n| MemberId::from(*n)).collect();
        let mut event = None;
        for node in &self.nodes {
            event = Some(node.view.set_members(members.clone()));
        }
        event.expect("cluster has nodes")
    }

    /// Run a rebalance on every node still in `event.current`.
    pub async fn rebalance(&self, event: &MembershipEvent) -> Vec<RebalanceReport> {
        let mut reports = Vec::new();
        for node in &self.nodes {
            if event.current.contains(&node.id) {
                reports.push(node.store.handle_membership_change(event).await);
            }
        }
        reports
    }

    /// Make a node unreachable (or reachable again).
    pub fn set_reachable(&self, name: &str, reachable: bool) {
        self.transport
            .set_reachable(&MemberId::from(name), reachable);
    }
}

/// Ids of the form `session-{i}`.
pub fn session_ids(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("session-{i}")).collect()
}
