//! The session store facade handed to HTTP collaborators.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::cluster::{ClusterView, MemberId, MembershipEvent, StaticClusterView};
use crate::codec::{AttributeCodec, JsonCodec};
use crate::config::StoreConfig;
use crate::entry::{AttributeValue, Mutation, SessionEntry};
use crate::error::Result;
use crate::eviction::EvictionReport;
use crate::replication::{RebalanceReport, ReplicationManager, WriteOutcome};
use crate::stats::StoreStats;
use crate::transport::{Disconnected, ReplicationTransport};

/// Builder for [`SessionStore`].
pub struct SessionStoreBuilder<C = JsonCodec> {
    config: StoreConfig,
    cluster: Option<Arc<dyn ClusterView>>,
    transport: Option<Arc<dyn ReplicationTransport>>,
    clock: SharedClock,
    codec: C,
}

impl Default for SessionStoreBuilder<JsonCodec> {
    fn default() -> Self {
        Self {
            config: StoreConfig::default(),
            cluster: None,
            transport: None,
            clock: Arc::new(SystemClock),
            codec: JsonCodec,
        }
    }
}

impl<C: AttributeCodec> SessionStoreBuilder<C> {
    /// Store configuration.
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Cluster view. Defaults to a single-member cluster named `local`.
    pub fn cluster(mut self, cluster: Arc<dyn ClusterView>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Replication transport. Defaults to [`Disconnected`].
    pub fn transport(mut self, transport: Arc<dyn ReplicationTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Time source. Defaults to the system clock.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Attribute codec used by the typed accessors.
    pub fn codec<D: AttributeCodec>(self, codec: D) -> SessionStoreBuilder<D> {
        SessionStoreBuilder {
            config: self.config,
            cluster: self.cluster,
            transport: self.transport,
            clock: self.clock,
            codec,
        }
    }

    /// Build the store. Must be called within a tokio runtime.
    pub fn build(self) -> SessionStore<C> {
        let cluster = self
            .cluster
            .unwrap_or_else(|| Arc::new(StaticClusterView::single("local")));
        let transport = self.transport.unwrap_or_else(|| Arc::new(Disconnected));
        let manager = ReplicationManager::new(cluster, transport, self.config, self.clock);

        SessionStore {
            inner: Arc::new(Inner {
                manager: Arc::new(manager),
                codec: self.codec,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

struct Inner<C> {
    manager: Arc<ReplicationManager>,
    codec: C,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C> Drop for Inner<C> {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// A node's view of the distributed session store.
///
/// Cheap to clone; clones share the same node.
///
/// # Example
///
/// ```rust,ignore
/// use sessionmesh_store::{SessionStore, StoreConfig};
///
/// let store = SessionStore::builder()
///     .config(StoreConfig::default().with_max_entries(1000))
///     .build();
///
/// store.put_value("session-1", "cart", &vec!["book"]).await?;
/// let cart: Option<Vec<String>> = store.get_value("session-1", "cart").await?;
/// ```
pub struct SessionStore<C = JsonCodec> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for SessionStore<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl SessionStore<JsonCodec> {
    /// Start building a store.
    pub fn builder() -> SessionStoreBuilder<JsonCodec> {
        SessionStoreBuilder::default()
    }

    /// Create a store over the given cluster view and transport.
    pub fn new(
        cluster: Arc<dyn ClusterView>,
        transport: Arc<dyn ReplicationTransport>,
        config: StoreConfig,
    ) -> Self {
        Self::builder()
            .cluster(cluster)
            .transport(transport)
            .config(config)
            .build()
    }
}

impl<C: AttributeCodec> SessionStore<C> {
    /// The replication manager behind this store.
    pub fn replication(&self) -> &Arc<ReplicationManager> {
        &self.inner.manager
    }

    /// This node's member id.
    pub fn local_member_id(&self) -> &MemberId {
        self.inner.manager.local_member_id()
    }

    /// Read a session.
    pub async fn get(&self, id: &str) -> Result<SessionEntry> {
        self.inner.manager.read(id).await
    }

    /// Read one attribute payload.
    pub async fn get_attribute(&self, id: &str, name: &str) -> Result<Option<AttributeValue>> {
        let entry = self.get(id).await?;
        Ok(entry.attributes.get(name).cloned())
    }

    /// Read and decode one attribute.
    pub async fn get_value<T: DeserializeOwned>(&self, id: &str, name: &str) -> Result<Option<T>> {
        match self.get_attribute(id, name).await? {
            Some(payload) => self.inner.codec.decode(&payload).map(Some),
            None => Ok(None),
        }
    }

    /// Set an attribute, creating the session if needed.
    pub async fn put(
        &self,
        id: &str,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Result<WriteOutcome> {
        let mutation = Mutation::SetAttribute {
            name: name.into(),
            value: value.into(),
        };
        self.inner.manager.write(id, mutation).await
    }

    /// Encode and set an attribute.
    pub async fn put_value<T: Serialize + ?Sized>(
        &self,
        id: &str,
        name: impl Into<String>,
        value: &T,
    ) -> Result<WriteOutcome> {
        let payload = self.inner.codec.encode(value)?;
        self.put(id, name, payload).await
    }

    /// Remove one attribute. Fails with `NotFound` if the session is absent.
    pub async fn remove_attribute(&self, id: &str, name: &str) -> Result<WriteOutcome> {
        let mutation = Mutation::RemoveAttribute {
            name: name.to_string(),
        };
        self.inner.manager.write(id, mutation).await
    }

    /// Invalidate a session. Fails with `NotFound` if the session is absent.
    pub async fn remove(&self, id: &str) -> Result<WriteOutcome> {
        self.inner.manager.write(id, Mutation::Invalidate).await
    }

    /// Refresh a session's idle timer.
    pub async fn touch(&self, id: &str) -> Result<WriteOutcome> {
        self.inner.manager.write(id, Mutation::Touch).await
    }

    /// Override (or with `None`, clear) a session's idle timeout.
    pub async fn set_idle_timeout(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<WriteOutcome> {
        let mutation = Mutation::SetIdleTimeout {
            seconds: timeout.map(|t| t.as_secs()),
        };
        self.inner.manager.write(id, mutation).await
    }

    /// This node's copy of a session, without routing or touching.
    pub fn local_copy(&self, id: &str) -> Option<SessionEntry> {
        self.inner.manager.local_copy(id)
    }

    /// Ids of the live sessions this node owns, sorted.
    ///
    /// Every live session is listed by exactly one member.
    pub fn session_ids(&self) -> Vec<String> {
        let manager = &self.inner.manager;
        let mut ids: Vec<String> = manager
            .store()
            .snapshot()
            .into_iter()
            .map(|entry| entry.id)
            .filter(|id| manager.cluster().is_local_owner(id))
            .collect();
        ids.sort();
        ids
    }

    /// Live sessions held on this node, owned and backup copies, by id.
    ///
    /// Nothing is touched.
    pub fn local_sessions(&self) -> Vec<SessionEntry> {
        let mut entries = self.inner.manager.store().snapshot();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Wait for queued backup pushes to be attempted.
    pub async fn flush(&self) {
        self.inner.manager.flush_backups().await;
    }

    /// Node statistics.
    pub fn stats(&self) -> StoreStats {
        self.inner.manager.stats().stats()
    }

    /// Whether this node is a running member of a non-empty cluster.
    pub fn is_healthy(&self) -> bool {
        self.inner.manager.stats().is_healthy()
    }

    /// Number of cluster members.
    pub fn cluster_size(&self) -> usize {
        self.inner.manager.stats().cluster_size()
    }

    /// Live entries held by this node.
    pub fn active_entry_count(&self) -> usize {
        self.inner.manager.stats().active_entry_count()
    }

    /// Run an eviction scan now.
    pub async fn run_eviction(&self) -> EvictionReport {
        self.inner.manager.run_eviction().await
    }

    /// Rebalance after a membership change.
    pub async fn handle_membership_change(&self, event: &MembershipEvent) -> RebalanceReport {
        self.inner.manager.on_membership_change(event).await
    }

    /// Spawn the periodic eviction scan and the membership listener.
    ///
    /// Tasks hold the node weakly and stop when it is dropped or shut down.
    pub fn start_background_tasks(&self) {
        let manager = &self.inner.manager;
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            debug!("Background tasks already running");
            return;
        }

        if manager.config().enable_eviction_task {
            let period = manager.config().eviction_scan_interval;
            tasks.push(tokio::spawn(eviction_loop(Arc::downgrade(manager), period)));
        }

        if let Some(events) = manager.cluster().subscribe() {
            tasks.push(tokio::spawn(membership_loop(Arc::downgrade(manager), events)));
        }

        info!(member = %manager.local_member_id(), tasks = tasks.len(), "Background tasks started");
    }

    /// Stop background tasks and shut the node down.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.inner.manager.shutdown().await;
    }
}

async fn eviction_loop(manager: Weak<ReplicationManager>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(manager) = manager.upgrade() else {
            break;
        };
        if manager.is_shut_down() {
            break;
        }
        let report = manager.run_eviction().await;
        debug!(removed = report.removed(), "Periodic eviction scan");
    }
}

async fn membership_loop(
    manager: Weak<ReplicationManager>,
    mut events: tokio::sync::broadcast::Receiver<MembershipEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Membership events lagged, rebalancing against current view");
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                MembershipEvent {
                    previous: Vec::new(),
                    current: manager.cluster().members(),
                }
            }
            Err(RecvError::Closed) => break,
        };

        let Some(manager) = manager.upgrade() else {
            break;
        };
        if manager.is_shut_down() {
            break;
        }
        manager.on_membership_change(&event).await;
    }
}

impl<C> std::fmt::Debug for SessionStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("manager", &self.inner.manager)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Error;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        visits: u32,
    }

    fn store_with_clock() -> (SessionStore, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = SessionStore::builder()
            .config(StoreConfig::default().with_idle_timeout(Duration::from_secs(60)))
            .clock(Arc::new(clock.clone()))
            .build();
        (store, clock)
    }

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let (store, _clock) = store_with_clock();

        store.put("s-1", "k", "v").await.unwrap();
        let entry = store.get("s-1").await.unwrap();

        assert_eq!(entry.attribute("k"), Some(&AttributeValue::from("v")));
    }

    #[tokio::test]
    async fn test_typed_values() {
        let (store, _clock) = store_with_clock();
        let profile = Profile {
            name: "alice".into(),
            visits: 3,
        };

        store.put_value("s-1", "profile", &profile).await.unwrap();

        let loaded: Option<Profile> = store.get_value("s-1", "profile").await.unwrap();
        let missing: Option<Profile> = store.get_value("s-1", "other").await.unwrap();
        assert_eq!(loaded, Some(profile));
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_remove_and_missing_operations() {
        let (store, _clock) = store_with_clock();
        store.put("s-1", "k", "v").await.unwrap();

        store.remove_attribute("s-1", "k").await.unwrap();
        assert_eq!(store.get_attribute("s-1", "k").await.unwrap(), None);

        store.remove("s-1").await.unwrap();
        assert!(matches!(store.get("s-1").await, Err(Error::NotFound(_))));
        assert!(matches!(store.remove("s-1").await, Err(Error::NotFound(_))));
        assert!(matches!(
            store.remove_attribute("s-1", "k").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_idle_timeout_and_touch() {
        let (store, clock) = store_with_clock();
        store.put("s-1", "k", "v").await.unwrap();

        clock.advance(Duration::from_secs(50));
        store.touch("s-1").await.unwrap();
        clock.advance(Duration::from_secs(50));
        assert!(store.get("s-1").await.is_ok());

        clock.advance(Duration::from_secs(61));
        assert!(matches!(store.get("s-1").await, Err(Error::NotFound(_))));

        let report = store.run_eviction().await;
        assert_eq!(report.expired, 1);
        assert_eq!(store.active_entry_count(), 0);
    }

    #[tokio::test]
    async fn test_per_session_idle_timeout() {
        let (store, clock) = store_with_clock();
        store.put("s-1", "k", "v").await.unwrap();
        store
            .set_idle_timeout("s-1", Some(Duration::from_secs(5)))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(6));

        assert!(matches!(store.get("s-1").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stats_and_health() {
        let (store, _clock) = store_with_clock();
        store.put("s-1", "k", "v").await.unwrap();
        store.put("s-2", "k", "v").await.unwrap();

        let stats = store.stats();

        assert!(store.is_healthy());
        assert_eq!(store.cluster_size(), 1);
        assert_eq!(stats.active_entries, 2);
        assert_eq!(stats.owned_entries, 2);
        assert_eq!(stats.counters.writes, 2);
    }

    #[tokio::test]
    async fn test_session_listing() {
        let (store, clock) = store_with_clock();
        store.put("s-2", "k", "v").await.unwrap();
        store.put("s-1", "k", "v").await.unwrap();

        let sessions = store.local_sessions();

        assert_eq!(store.session_ids(), ["s-1", "s-2"]);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, "s-1");
        assert_eq!(sessions[0].version, 1);

        store.remove("s-1").await.unwrap();
        assert_eq!(store.session_ids(), ["s-2"]);

        clock.advance(Duration::from_secs(61));
        assert!(store.session_ids().is_empty());
        assert!(store.local_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_store() {
        let (store, _clock) = store_with_clock();
        store.start_background_tasks();

        store.shutdown().await;

        assert!(matches!(store.put("s-1", "k", "v").await, Err(Error::Shutdown)));
    }
}
