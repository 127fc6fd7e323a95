//! Replicated session store.
//!
//! This crate provides a distributed, in-memory session store with:
//! - Per-key concurrent entry storage with versioned mutations
//! - Idle-timeout and optional absolute-TTL expiry
//! - Size-bound LRU eviction of owned entries
//! - Owner/backup replication with last-writer-wins by version
//! - Rebalancing of locally held keys on membership change
//!
//! Cluster membership and the wire between nodes are supplied by the caller
//! through [`ClusterView`] and [`ReplicationTransport`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sessionmesh_store::{LocalTransport, SessionStore, StaticClusterView, StoreConfig};
//!
//! let view = Arc::new(StaticClusterView::single("node-1"));
//! let store = SessionStore::new(view, Arc::new(LocalTransport::new()), StoreConfig::default());
//! store.start_background_tasks();
//!
//! store.put("session-1", "user", "alice").await?;
//! ```

mod clock;
mod cluster;
mod codec;
mod config;
mod entry;
mod error;
mod eviction;
mod expiry;
mod replication;
mod ring;
mod session;
mod stats;
mod store;
mod transport;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use cluster::{ClusterView, MemberId, MembershipEvent, StaticClusterView};
pub use codec::{AttributeCodec, JsonCodec};
pub use config::{
    BackupMode, DEFAULT_BACKUP_COUNT, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_ENTRIES,
    DEFAULT_MAX_RETRIES, DEFAULT_OPERATION_TIMEOUT, DEFAULT_RETRY_BACKOFF, DEFAULT_SCAN_INTERVAL,
    DEFAULT_SEND_TIMEOUT, StoreConfig,
};
pub use entry::{AttributeValue, Mutation, SessionEntry};
pub use error::{Error, Result};
pub use eviction::{EvictionEngine, EvictionReport, EvictionState};
pub use expiry::ExpiryPolicy;
pub use replication::{RebalanceReport, ReplicationManager, WriteOutcome};
pub use ring::{DEFAULT_VIRTUAL_NODES, HashRing};
pub use session::{SessionStore, SessionStoreBuilder};
pub use stats::{Metrics, MetricsSnapshot, StatsFacade, StoreStats};
pub use store::{ApplyOutcome, Candidate, EntryStore, RemoveOutcome, UpdateOutcome};
pub use transport::{
    Disconnected, LocalTransport, ReplicationMessage, ReplicationTransport, TransportError,
};
