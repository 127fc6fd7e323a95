//! Cluster view adapter.
//!
//! The store never discovers peers itself. A [`ClusterView`] answers who the
//! members are and who owns a key; membership changes arrive as
//! [`MembershipEvent`]s. [`StaticClusterView`] is a reference adapter over a
//! static member list and a [`HashRing`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::config::DEFAULT_BACKUP_COUNT;
use crate::ring::{DEFAULT_VIRTUAL_NODES, HashRing};

/// Capacity of the membership event channel.
const EVENT_CAPACITY: usize = 64;

/// Identifier of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    /// Create a member id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MemberId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A change in cluster membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEvent {
    /// Members before the change.
    pub previous: Vec<MemberId>,
    /// Members after the change.
    pub current: Vec<MemberId>,
}

impl MembershipEvent {
    /// Members present now but not before.
    pub fn added(&self) -> Vec<MemberId> {
        let before: BTreeSet<&MemberId> = self.previous.iter().collect();
        self.current
            .iter()
            .filter(|m| !before.contains(m))
            .cloned()
            .collect()
    }

    /// Members present before but not now.
    pub fn removed(&self) -> Vec<MemberId> {
        let now: BTreeSet<&MemberId> = self.current.iter().collect();
        self.previous
            .iter()
            .filter(|m| !now.contains(m))
            .cloned()
            .collect()
    }
}

/// Cluster membership and key placement, as seen by one node.
///
/// Implementations must agree cluster-wide: every node must compute the same
/// `owner` and `backups` for a key given the same member list.
pub trait ClusterView: Send + Sync {
    /// Current members.
    fn members(&self) -> Vec<MemberId>;

    /// Owner of `id`, or `None` when the cluster is empty.
    fn owner(&self, id: &str) -> Option<MemberId>;

    /// Backups of `id`, excluding the owner.
    fn backups(&self, id: &str) -> Vec<MemberId>;

    /// This node's member id.
    fn local_member_id(&self) -> MemberId;

    /// Whether this node considers itself an active member.
    fn is_running(&self) -> bool;

    /// Subscribe to membership changes, if the adapter publishes them.
    fn subscribe(&self) -> Option<broadcast::Receiver<MembershipEvent>> {
        None
    }

    /// `[owner] + backups` for `id`.
    fn replica_set(&self, id: &str) -> Vec<MemberId> {
        let mut replicas: Vec<MemberId> = self.owner(id).into_iter().collect();
        replicas.extend(self.backups(id));
        replicas
    }

    /// Whether this node owns `id`.
    fn is_local_owner(&self, id: &str) -> bool {
        self.owner(id) == Some(self.local_member_id())
    }
}

/// Cluster view over an explicitly managed member list.
pub struct StaticClusterView {
    local: MemberId,
    backup_count: usize,
    virtual_nodes: usize,
    ring: RwLock<HashRing>,
    running: AtomicBool,
    events: broadcast::Sender<MembershipEvent>,
}

impl StaticClusterView {
    /// Create a view for `local` over `members`.
    ///
    /// `local` is not added implicitly; include it in `members`.
    pub fn new(
        local: impl Into<MemberId>,
        members: impl IntoIterator<Item = MemberId>,
        backup_count: usize,
    ) -> Self {
        Self::with_virtual_nodes(local, members, backup_count, DEFAULT_VIRTUAL_NODES)
    }

    /// Create a view with an explicit number of ring points per member.
    pub fn with_virtual_nodes(
        local: impl Into<MemberId>,
        members: impl IntoIterator<Item = MemberId>,
        backup_count: usize,
        virtual_nodes: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            local: local.into(),
            backup_count,
            virtual_nodes,
            ring: RwLock::new(HashRing::new(members, virtual_nodes)),
            running: AtomicBool::new(true),
            events,
        }
    }

    /// Single-member cluster.
    pub fn single(local: impl Into<MemberId>) -> Self {
        let local = local.into();
        Self::new(local.clone(), [local], DEFAULT_BACKUP_COUNT)
    }

    /// Number of backups this view assigns per key.
    pub fn backup_count(&self) -> usize {
        self.backup_count
    }

    /// Replace the member list and publish the change.
    ///
    /// Returns the event, which is also broadcast to subscribers.
    pub fn set_members(&self, members: impl IntoIterator<Item = MemberId>) -> MembershipEvent {
        let next = HashRing::new(members, self.virtual_nodes);
        let event = {
            let mut ring = self.ring.write();
            let previous = ring.members().to_vec();
            let current = next.members().to_vec();
            *ring = next;
            MembershipEvent { previous, current }
        };
        info!(
            member = %self.local,
            added = ?event.added(),
            removed = ?event.removed(),
            "Membership changed"
        );
        // No subscribers is fine.
        let _ = self.events.send(event.clone());
        event
    }

    /// Mark this node running or stopped.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

impl ClusterView for StaticClusterView {
    fn members(&self) -> Vec<MemberId> {
        self.ring.read().members().to_vec()
    }

    fn owner(&self, id: &str) -> Option<MemberId> {
        self.ring.read().owner(id)
    }

    fn backups(&self, id: &str) -> Vec<MemberId> {
        self.ring
            .read()
            .replicas(id, self.backup_count + 1)
            .into_iter()
            .skip(1)
            .collect()
    }

    fn local_member_id(&self) -> MemberId {
        self.local.clone()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<MembershipEvent>> {
        Some(self.events.subscribe())
    }

    fn replica_set(&self, id: &str) -> Vec<MemberId> {
        self.ring.read().replicas(id, self.backup_count + 1)
    }
}

impl fmt::Debug for StaticClusterView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticClusterView")
            .field("local", &self.local)
            .field("members", &self.members())
            .field("backup_count", &self.backup_count)
            .field("running", &self.is_running())
            .finish()
    }
}
