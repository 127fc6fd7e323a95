//! Replication transport.
//!
//! The store is transport-agnostic: a [`ReplicationTransport`] carries
//! [`ReplicationMessage`]s, fetches and (optionally) forwarded writes between
//! members. [`LocalTransport`] wires several in-process nodes together and can
//! mark members unreachable to simulate crashes and partitions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::cluster::MemberId;
use crate::entry::{Mutation, SessionEntry};
use crate::replication::{ReplicationManager, WriteOutcome};
use crate::store::ApplyOutcome;

/// Error from a transport call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The member could not be reached.
    #[error("Member unreachable: {0}")]
    Unreachable(MemberId),

    /// The transport does not implement this operation.
    #[error("Operation not supported by transport: {0}")]
    Unsupported(&'static str),

    /// The attempt exceeded its time box.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The member refused the request.
    #[error("Rejected by {member}: {reason}")]
    Rejected { member: MemberId, reason: String },
}

impl TransportError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Unsupported(_))
    }
}

/// A mutation shipped from an owner to a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationMessage {
    /// Session identifier.
    pub id: String,
    /// Mutation to apply.
    pub mutation: Mutation,
    /// Version stamped by the owner.
    pub version: u64,
    /// Sending member.
    pub origin: MemberId,
}

/// Carries replication traffic between members.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    /// Deliver a replicated mutation to `to`.
    async fn replicate(
        &self,
        to: &MemberId,
        message: ReplicationMessage,
    ) -> Result<ApplyOutcome, TransportError>;

    /// Fetch the live copy of `id` held by `from`.
    ///
    /// `touch` asks the member to refresh the idle timer when it owns `id`.
    async fn fetch(
        &self,
        from: &MemberId,
        id: &str,
        touch: bool,
    ) -> Result<Option<SessionEntry>, TransportError>;

    /// Forward a write to the owner `to`.
    async fn forward(
        &self,
        to: &MemberId,
        id: &str,
        mutation: Mutation,
    ) -> crate::Result<WriteOutcome> {
        let _ = (to, id, mutation);
        Err(TransportError::Unsupported("forward").into())
    }
}

/// Transport for a node with no peers. Every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disconnected;

#[async_trait]
impl ReplicationTransport for Disconnected {
    async fn replicate(
        &self,
        to: &MemberId,
        _message: ReplicationMessage,
    ) -> Result<ApplyOutcome, TransportError> {
        Err(TransportError::Unreachable(to.clone()))
    }

    async fn fetch(
        &self,
        from: &MemberId,
        _id: &str,
        _touch: bool,
    ) -> Result<Option<SessionEntry>, TransportError> {
        Err(TransportError::Unreachable(from.clone()))
    }
}

/// In-process transport between registered nodes.
///
/// Nodes are held weakly, so dropping a node's store makes it unreachable.
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<MemberId, Weak<ReplicationManager>>>,
    unreachable: RwLock<HashSet<MemberId>>,
    forwarding: bool,
    delivered: AtomicU64,
}

impl LocalTransport {
    /// Create a transport without write forwarding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable write forwarding to owners.
    pub fn with_forwarding(mut self, enabled: bool) -> Self {
        self.forwarding = enabled;
        self
    }

    /// Register a node under its member id.
    pub fn register(&self, member: MemberId, node: &Arc<ReplicationManager>) {
        self.nodes.write().insert(member, Arc::downgrade(node));
    }

    /// Remove a node.
    pub fn deregister(&self, member: &MemberId) {
        self.nodes.write().remove(member);
    }

    /// Mark a member reachable or unreachable.
    pub fn set_reachable(&self, member: &MemberId, reachable: bool) {
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(member);
        } else {
            unreachable.insert(member.clone());
        }
    }

    /// Whether a member is currently reachable.
    pub fn is_reachable(&self, member: &MemberId) -> bool {
        self.node(member).is_ok()
    }

    /// Number of messages delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn node(&self, member: &MemberId) -> Result<Arc<ReplicationManager>, TransportError> {
        if self.unreachable.read().contains(member) {
            return Err(TransportError::Unreachable(member.clone()));
        }
        let node = self
            .nodes
            .read()
            .get(member)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unreachable(member.clone()))?;
        if !node.cluster().is_running() {
            return Err(TransportError::Rejected {
                member: member.clone(),
                reason: "member is not running".to_string(),
            });
        }
        Ok(node)
    }
}

#[async_trait]
impl ReplicationTransport for LocalTransport {
    async fn replicate(
        &self,
        to: &MemberId,
        message: ReplicationMessage,
    ) -> Result<ApplyOutcome, TransportError> {
        let node = self.node(to)?;
        trace!(
            member = %to,
            session_id = %message.id,
            version = message.version,
            op = message.mutation.kind(),
            "Delivering replicated mutation"
        );
        let outcome = node.apply_replicated(&message.id, &message.mutation, message.version);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(outcome)
    }

    async fn fetch(
        &self,
        from: &MemberId,
        id: &str,
        touch: bool,
    ) -> Result<Option<SessionEntry>, TransportError> {
        let node = self.node(from)?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(node.serve_fetch(id, touch))
    }

    async fn forward(
        &self,
        to: &MemberId,
        id: &str,
        mutation: Mutation,
    ) -> crate::Result<WriteOutcome> {
        if !self.forwarding {
            return Err(TransportError::Unsupported("forward").into());
        }
        let node = self.node(to)?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        node.handle_forwarded(id, mutation).await
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("nodes", &self.nodes.read().len())
            .field("unreachable", &self.unreachable.read().len())
            .field("forwarding", &self.forwarding)
            .field("delivered", &self.delivered())
            .finish()
    }
}
