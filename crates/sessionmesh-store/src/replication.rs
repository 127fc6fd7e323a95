//! Owner/backup replication.
//!
//! Every mutation is routed through a [`ReplicationManager`]. On the owner it
//! is applied to the [`EntryStore`], which stamps the next version, and a full
//! snapshot carrying that version is pushed to each backup. Replicas apply a
//! pushed snapshot only if its version is newer than what they hold, so
//! delivery order and re-delivery do not matter.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::clock::SharedClock;
use crate::cluster::{ClusterView, MemberId, MembershipEvent};
use crate::config::{BackupMode, StoreConfig};
use crate::entry::{Mutation, SessionEntry};
use crate::error::{Error, Result};
use crate::eviction::{EvictionEngine, EvictionReport};
use crate::stats::{Metrics, StatsFacade};
use crate::store::{Applied, ApplyOutcome, EntryStore};
use crate::transport::{ReplicationMessage, ReplicationTransport, TransportError};

/// Result of an acknowledged write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOutcome {
    /// Applied on the owner. `backups` is the number of backups the write
    /// was sent (or queued) to.
    Acknowledged { version: u64, backups: usize },
    /// Applied on the owner, but these backups failed after retries.
    PartialFailure { version: u64, failed: Vec<MemberId> },
}

impl WriteOutcome {
    /// Version stamped by the owner.
    pub fn version(&self) -> u64 {
        match self {
            WriteOutcome::Acknowledged { version, .. }
            | WriteOutcome::PartialFailure { version, .. } => *version,
        }
    }

    /// Whether every backup received the write (or it was queued).
    pub fn is_complete(&self) -> bool {
        matches!(self, WriteOutcome::Acknowledged { .. })
    }
}

/// What a membership change did to locally held keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceReport {
    /// Snapshots pushed to members that joined a replica set.
    pub pushed: usize,
    /// Local copies dropped because this node left the replica set.
    pub released: usize,
    /// Pushes that failed and were queued for retry.
    pub failed: usize,
    /// Keys whose replica set did not change.
    pub unchanged: usize,
}

/// Work for the backup worker.
enum BackupJob {
    Push {
        targets: Vec<MemberId>,
        message: ReplicationMessage,
    },
    Barrier(oneshot::Sender<()>),
}

/// A rebalance push that failed and awaits retry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingPush {
    id: String,
    to: MemberId,
}

/// Sends backup pushes with a per-attempt time box and bounded retries.
struct Pusher {
    transport: Arc<dyn ReplicationTransport>,
    metrics: Arc<Metrics>,
    max_retries: u32,
    retry_backoff: Duration,
    send_timeout: Duration,
}

impl Pusher {
    async fn push(
        &self,
        to: &MemberId,
        message: &ReplicationMessage,
    ) -> std::result::Result<ApplyOutcome, TransportError> {
        let result = with_retry(self.max_retries, self.retry_backoff, to, move || async move {
            match tokio::time::timeout(
                self.send_timeout,
                self.transport.replicate(to, message.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.send_timeout)),
            }
        })
        .await;

        if let Err(ref e) = result {
            Metrics::incr(&self.metrics.partial_failures);
            warn!(
                member = %to,
                session_id = %message.id,
                version = message.version,
                error = %e,
                "Backup push dropped after exhausting retries"
            );
        }
        result
    }

    /// Push to every target concurrently. Returns the targets that failed.
    async fn push_all(&self, targets: &[MemberId], message: &ReplicationMessage) -> Vec<MemberId> {
        let results = join_all(targets.iter().map(|to| self.push(to, message))).await;
        failed_targets(targets, results)
    }

    /// Like [`push_all`](Self::push_all), but targets still pending after
    /// `limit` count as failed.
    async fn push_all_within(
        &self,
        targets: &[MemberId],
        message: &ReplicationMessage,
        limit: Duration,
    ) -> Vec<MemberId> {
        let results = join_all(targets.iter().map(|to| async move {
            match tokio::time::timeout(limit, self.push(to, message)).await {
                Ok(result) => result,
                Err(_) => {
                    Metrics::incr(&self.metrics.partial_failures);
                    warn!(
                        member = %to,
                        session_id = %message.id,
                        version = message.version,
                        limit_ms = limit.as_millis() as u64,
                        "Backup push cut off by write deadline"
                    );
                    Err(TransportError::Timeout(limit))
                }
            }
        }))
        .await;
        failed_targets(targets, results)
    }
}

fn failed_targets<T, E>(
    targets: &[MemberId],
    results: Vec<std::result::Result<T, E>>,
) -> Vec<MemberId> {
    targets
        .iter()
        .zip(results)
        .filter(|(_, result)| result.is_err())
        .map(|(to, _)| to.clone())
        .collect()
}

/// Time budget of one client operation.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    fn after(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }
}

/// Run `f` until it succeeds, retrying retryable errors with exponential backoff.
async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: Duration,
    target: &MemberId,
    mut f: F,
) -> std::result::Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, TransportError>>,
{
    let mut last_error = None;
    let mut backoff = initial_backoff;

    for attempt in 0..=max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }

                if attempt < max_retries {
                    debug!(
                        member = %target,
                        attempt = attempt + 1,
                        max_retries = max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Push failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| TransportError::Unreachable(target.clone())))
}

/// Coordinates writes, reads and replication for one node.
pub struct ReplicationManager {
    local: MemberId,
    store: Arc<EntryStore>,
    cluster: Arc<dyn ClusterView>,
    transport: Arc<dyn ReplicationTransport>,
    config: StoreConfig,
    metrics: Arc<Metrics>,
    eviction: EvictionEngine,
    pusher: Arc<Pusher>,
    backlog: mpsc::UnboundedSender<BackupJob>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Replica set each locally held key was last placed on.
    placements: DashMap<String, Vec<MemberId>>,
    pending: Mutex<Vec<PendingPush>>,
    closed: AtomicBool,
}

impl ReplicationManager {
    /// Create a manager and spawn its backup worker.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        cluster: Arc<dyn ClusterView>,
        transport: Arc<dyn ReplicationTransport>,
        config: StoreConfig,
        clock: SharedClock,
    ) -> Self {
        let store = Arc::new(EntryStore::new(
            config.expiry_policy(),
            config.touch_on_read,
            clock,
        ));
        let metrics = Arc::new(Metrics::new());
        let pusher = Arc::new(Pusher {
            transport: Arc::clone(&transport),
            metrics: Arc::clone(&metrics),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            send_timeout: config.send_timeout,
        });

        let (backlog, mut rx) = mpsc::unbounded_channel::<BackupJob>();
        let worker_pusher = Arc::clone(&pusher);
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    BackupJob::Push { targets, message } => {
                        worker_pusher.push_all(&targets, &message).await;
                    }
                    BackupJob::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Backup worker stopped");
        });

        let local = cluster.local_member_id();
        info!(
            member = %local,
            backup_mode = ?config.backup_mode,
            max_entries = config.max_entries,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Replication manager started"
        );

        Self {
            local,
            eviction: EvictionEngine::new(config.max_entries, config.idle_timeout),
            store,
            cluster,
            transport,
            config,
            metrics,
            pusher,
            backlog,
            worker: Mutex::new(Some(worker)),
            placements: DashMap::new(),
            pending: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// This node's member id.
    pub fn local_member_id(&self) -> &MemberId {
        &self.local
    }

    /// Local entry storage (read-only access).
    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    /// Cluster view.
    pub fn cluster(&self) -> &dyn ClusterView {
        self.cluster.as_ref()
    }

    /// Configuration in force.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Operation counters.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Eviction engine.
    pub fn eviction(&self) -> &EvictionEngine {
        &self.eviction
    }

    /// Stats/health view over this node.
    pub fn stats(&self) -> StatsFacade<'_> {
        StatsFacade::new(
            &self.store,
            self.cluster.as_ref(),
            &self.metrics,
            self.eviction.state(),
        )
    }

    /// Number of rebalance pushes waiting for retry.
    pub fn pending_pushes(&self) -> usize {
        self.pending.lock().len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────

    /// Route a mutation to the owner of `id` within the configured deadline.
    pub async fn write(&self, id: &str, mutation: Mutation) -> Result<WriteOutcome> {
        self.write_within(id, mutation, self.config.operation_timeout)
            .await
    }

    /// Route a mutation to the owner of `id`, giving up after `deadline`.
    ///
    /// The deadline bounds reaching the owner. Once the owner has applied the
    /// write it is acknowledged; sync-mode backups still unanswered when the
    /// deadline runs out are reported in [`WriteOutcome::PartialFailure`].
    pub async fn write_within(
        &self,
        id: &str,
        mutation: Mutation,
        deadline: Duration,
    ) -> Result<WriteOutcome> {
        self.route_write(id, mutation, Deadline::after(deadline))
            .await
    }

    async fn route_write(
        &self,
        id: &str,
        mutation: Mutation,
        deadline: Deadline,
    ) -> Result<WriteOutcome> {
        self.ensure_open()?;

        let Some(owner) = self.cluster.owner(id) else {
            return Err(Error::OwnerUnavailable {
                id: id.to_string(),
                owner: None,
            });
        };

        if owner == self.local {
            return self.apply_as_owner(id, mutation, deadline).await;
        }

        let forward = self.transport.forward(&owner, id, mutation);
        match tokio::time::timeout(deadline.remaining(), forward).await {
            Ok(Ok(outcome)) => {
                Metrics::incr(&self.metrics.forwarded);
                Ok(outcome)
            }
            Ok(Err(Error::Transport(e))) => {
                debug!(session_id = %id, owner = %owner, error = %e, "Cannot reach owner for write");
                Err(Error::OwnerUnavailable {
                    id: id.to_string(),
                    owner: Some(owner),
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(session_id = %id, owner = %owner, deadline_ms = deadline.budget.as_millis() as u64, "Write deadline exceeded");
                Err(Error::OwnerUnavailable {
                    id: id.to_string(),
                    owner: Some(owner),
                })
            }
        }
    }

    /// Handle a write forwarded by another member. Never forwards again.
    pub async fn handle_forwarded(&self, id: &str, mutation: Mutation) -> Result<WriteOutcome> {
        self.ensure_open()?;
        if !self.cluster.is_local_owner(id) {
            return Err(Error::OwnerUnavailable {
                id: id.to_string(),
                owner: self.cluster.owner(id),
            });
        }
        self.apply_as_owner(id, mutation, Deadline::after(self.config.operation_timeout))
            .await
    }

    async fn apply_as_owner(
        &self,
        id: &str,
        mutation: Mutation,
        deadline: Deadline,
    ) -> Result<WriteOutcome> {
        Metrics::incr(&self.metrics.writes);
        let creates = mutation.creates();
        let applied = self.store.apply(id, &mutation)?;
        let outcome = self.propagate(id, &applied, deadline).await;

        if creates && self.store.len() > self.config.max_entries {
            self.eviction.evict_overflow(self).await;
        }
        Ok(outcome)
    }

    /// Send the post-mutation state to every backup of `id`.
    ///
    /// In sync mode the wait for backups is bounded by `deadline`.
    async fn propagate(&self, id: &str, applied: &Applied, deadline: Deadline) -> WriteOutcome {
        let (mutation, version) = match applied {
            Applied::Updated(entry) => {
                self.placements.insert(id.to_string(), self.replica_set(id));
                (
                    Mutation::Sync {
                        entry: entry.clone(),
                    },
                    entry.version,
                )
            }
            Applied::Removed { version } => {
                self.placements.remove(id);
                (Mutation::Invalidate, *version)
            }
        };

        let targets = self.backup_targets(id);
        if targets.is_empty() {
            return WriteOutcome::Acknowledged {
                version,
                backups: 0,
            };
        }

        let message = ReplicationMessage {
            id: id.to_string(),
            mutation,
            version,
            origin: self.local.clone(),
        };

        match self.config.backup_mode {
            BackupMode::Async => {
                let backups = targets.len();
                self.enqueue(targets, message);
                WriteOutcome::Acknowledged { version, backups }
            }
            BackupMode::Sync => {
                let failed = self
                    .pusher
                    .push_all_within(&targets, &message, deadline.remaining())
                    .await;
                if failed.is_empty() {
                    WriteOutcome::Acknowledged {
                        version,
                        backups: targets.len(),
                    }
                } else {
                    WriteOutcome::PartialFailure { version, failed }
                }
            }
        }
    }

    /// Owner and backups of `id`, capped at `backup_count` backups.
    fn replica_set(&self, id: &str) -> Vec<MemberId> {
        let mut replicas = self.cluster.replica_set(id);
        replicas.truncate(self.config.backup_count + 1);
        replicas
    }

    /// Backups of `id` other than this node, capped at `backup_count`.
    fn backups(&self, id: &str) -> Vec<MemberId> {
        let mut backups = self.cluster.backups(id);
        backups.truncate(self.config.backup_count);
        backups
    }

    fn backup_targets(&self, id: &str) -> Vec<MemberId> {
        self.backups(id)
            .into_iter()
            .filter(|m| *m != self.local)
            .collect()
    }

    fn enqueue(&self, targets: Vec<MemberId>, message: ReplicationMessage) {
        if self
            .backlog
            .send(BackupJob::Push { targets, message })
            .is_err()
        {
            Metrics::incr(&self.metrics.partial_failures);
            warn!(member = %self.local, "Backup worker gone, push dropped");
        }
    }

    /// Wait until every queued backup push has been attempted.
    pub async fn flush_backups(&self) {
        let (done, wait) = oneshot::channel();
        if self.backlog.send(BackupJob::Barrier(done)).is_ok() {
            let _ = wait.await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────

    /// Read `id` from the best available replica within the configured deadline.
    pub async fn read(&self, id: &str) -> Result<SessionEntry> {
        self.read_within(id, self.config.operation_timeout).await
    }

    /// Read `id`, giving up with `Unavailable` after `deadline`.
    pub async fn read_within(&self, id: &str, deadline: Duration) -> Result<SessionEntry> {
        match tokio::time::timeout(deadline, self.route_read(id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(session_id = %id, deadline_ms = deadline.as_millis() as u64, "Read deadline exceeded");
                Err(Error::Unavailable(id.to_string()))
            }
        }
    }

    async fn route_read(&self, id: &str) -> Result<SessionEntry> {
        self.ensure_open()?;

        let Some(owner) = self.cluster.owner(id) else {
            return Err(Error::Unavailable(id.to_string()));
        };

        if owner == self.local {
            Metrics::incr(&self.metrics.reads);
            return self.read_local(id);
        }

        let fetch = self
            .transport
            .fetch(&owner, id, self.store.touches_on_read());
        match tokio::time::timeout(self.config.send_timeout, fetch).await {
            Ok(Ok(Some(entry))) => return Ok(entry),
            Ok(Ok(None)) => return Err(Error::NotFound(id.to_string())),
            Ok(Err(e)) => {
                debug!(session_id = %id, owner = %owner, error = %e, "Owner unreachable, reading from backups");
            }
            Err(_) => {
                debug!(session_id = %id, owner = %owner, "Owner fetch timed out, reading from backups");
            }
        }

        self.read_from_backups(id).await
    }

    /// Read the owned copy, propagating the touch to backups.
    fn read_local(&self, id: &str) -> Result<SessionEntry> {
        let entry = self.store.get(id)?;
        if self.store.touches_on_read() {
            let targets = self.backup_targets(id);
            if !targets.is_empty() {
                let message = ReplicationMessage {
                    id: id.to_string(),
                    version: entry.version,
                    mutation: Mutation::Sync {
                        entry: entry.clone(),
                    },
                    origin: self.local.clone(),
                };
                self.enqueue(targets, message);
            }
        }
        Ok(entry)
    }

    async fn read_from_backups(&self, id: &str) -> Result<SessionEntry> {
        let backups = self.backups(id);
        let mut answered = false;
        let mut best: Option<SessionEntry> = None;

        if backups.contains(&self.local) {
            Metrics::incr(&self.metrics.reads);
            answered = true;
            best = self.store.peek(id);
        }

        let remote: Vec<&MemberId> = backups.iter().filter(|m| **m != self.local).collect();
        let results = join_all(remote.iter().map(move |member| async move {
            tokio::time::timeout(self.config.send_timeout, self.transport.fetch(member, id, false))
                .await
                .unwrap_or(Err(TransportError::Timeout(self.config.send_timeout)))
        }))
        .await;

        for (member, result) in remote.iter().zip(results) {
            match result {
                Ok(Some(entry)) => {
                    answered = true;
                    if best.as_ref().is_none_or(|b| entry.version > b.version) {
                        best = Some(entry);
                    }
                }
                Ok(None) => answered = true,
                Err(e) => {
                    debug!(session_id = %id, member = %member, error = %e, "Backup unreachable");
                }
            }
        }

        match best {
            Some(entry) => Ok(entry),
            None if answered => Err(Error::NotFound(id.to_string())),
            None => Err(Error::Unavailable(id.to_string())),
        }
    }

    /// Serve a fetch from another member.
    pub fn serve_fetch(&self, id: &str, touch: bool) -> Option<SessionEntry> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Metrics::incr(&self.metrics.reads);
        if touch && self.cluster.is_local_owner(id) {
            self.read_local(id).ok()
        } else {
            self.store.peek(id)
        }
    }

    /// Local copy of `id`, without routing or touching.
    pub fn local_copy(&self, id: &str) -> Option<SessionEntry> {
        self.store.peek(id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound replication
    // ─────────────────────────────────────────────────────────────────────

    /// Apply a mutation pushed by an owner. Idempotent.
    pub fn apply_replicated(&self, id: &str, mutation: &Mutation, version: u64) -> ApplyOutcome {
        let outcome = self.store.apply_replicated(id, mutation, version);
        match outcome {
            ApplyOutcome::Applied { .. } => {
                Metrics::incr(&self.metrics.replicated_applied);
                if mutation.is_removal() {
                    self.placements.remove(id);
                } else {
                    self.placements.insert(id.to_string(), self.replica_set(id));
                }
                trace!(session_id = %id, version, op = mutation.kind(), "Applied replicated mutation");
            }
            ApplyOutcome::Stale { local_version } => {
                Metrics::incr(&self.metrics.stale_ignored);
                trace!(session_id = %id, version, local_version, "Ignored stale replicated mutation");
            }
            ApplyOutcome::Missing => {
                debug!(session_id = %id, version, op = mutation.kind(), "Replicated mutation for unknown entry");
            }
        }
        outcome
    }

    // ─────────────────────────────────────────────────────────────────────
    // Removal paths used by eviction
    // ─────────────────────────────────────────────────────────────────────

    /// Remove an owned entry if it is still expired, informing backups.
    pub(crate) async fn expire_owned(&self, id: &str) -> bool {
        let Some(removed) = self.store.remove_if_expired(id) else {
            return false;
        };
        debug!(session_id = %id, version = removed.version, "Expired entry removed");
        Metrics::incr(&self.metrics.expired);
        self.propagate(
            id,
            &Applied::Removed {
                version: removed.version + 1,
            },
            Deadline::after(self.config.operation_timeout),
        )
        .await;
        true
    }

    /// Remove an owned entry if it is still at `version`, informing backups.
    pub(crate) async fn evict_owned(&self, id: &str, version: u64) -> bool {
        let Some(removed) = self.store.remove_if_version(id, version) else {
            trace!(session_id = %id, version, "Eviction victim changed, skipping");
            return false;
        };
        debug!(session_id = %id, version = removed.version, "Entry evicted");
        Metrics::incr(&self.metrics.evicted);
        self.propagate(
            id,
            &Applied::Removed {
                version: removed.version + 1,
            },
            Deadline::after(self.config.operation_timeout),
        )
        .await;
        true
    }

    /// Drop an expired non-owned copy once its grace has passed.
    pub(crate) fn drop_orphan(&self, id: &str, grace: Duration) -> bool {
        if self.store.remove_orphan(id, grace).is_some() {
            self.placements.remove(id);
            debug!(session_id = %id, "Orphaned copy dropped");
            true
        } else {
            false
        }
    }

    /// Run one eviction scan now.
    pub async fn run_eviction(&self) -> EvictionReport {
        self.eviction.scan(self).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Membership
    // ─────────────────────────────────────────────────────────────────────

    /// Re-place every locally held key after a membership change.
    ///
    /// For each key whose replica set changed, the first surviving member of
    /// the previous replica set pushes a snapshot to the members that joined
    /// it. A node that left the replica set drops its copy once the pushes
    /// it was responsible for have succeeded.
    pub async fn on_membership_change(&self, event: &MembershipEvent) -> RebalanceReport {
        info!(
            member = %self.local,
            added = ?event.added(),
            removed = ?event.removed(),
            entries = self.store.len(),
            "Rebalancing after membership change"
        );

        let mut report = RebalanceReport::default();
        report.pushed += self.retry_pending().await;

        let members = self.cluster.members();
        for entry in self.store.snapshot() {
            let id = entry.id.clone();
            let current = self.replica_set(&id);
            let previous = self
                .placements
                .get(&id)
                .map(|p| p.value().clone())
                .unwrap_or_else(|| current.clone());

            if previous == current {
                report.unchanged += 1;
                continue;
            }

            let pusher = previous.iter().find(|m| members.contains(m));
            let responsible = match pusher {
                Some(member) => *member == self.local,
                None => current.first() == Some(&self.local),
            };
            let stays = current.contains(&self.local);

            let mut failed = Vec::new();
            if responsible {
                let targets: Vec<MemberId> = current
                    .iter()
                    .filter(|m| **m != self.local && !previous.contains(m))
                    .cloned()
                    .collect();
                if !targets.is_empty() {
                    let message = self.snapshot_message(&entry);
                    failed = self.pusher.push_all(&targets, &message).await;
                    report.pushed += targets.len() - failed.len();
                    Metrics::add(
                        &self.metrics.rebalance_pushes,
                        (targets.len() - failed.len()) as u64,
                    );
                }
            }

            if !failed.is_empty() {
                report.failed += failed.len();
                let mut pending = self.pending.lock();
                for to in failed {
                    let push = PendingPush {
                        id: id.clone(),
                        to,
                    };
                    if !pending.contains(&push) {
                        pending.push(push);
                    }
                }
                // Keep the copy (and old placement) until the push succeeds.
                continue;
            }

            if stays {
                self.placements.insert(id, current);
            } else if self.store.release(&id, entry.version) {
                self.placements.remove(&id);
                report.released += 1;
                trace!(session_id = %id, "Released copy after leaving replica set");
            }
        }

        info!(
            member = %self.local,
            pushed = report.pushed,
            released = report.released,
            failed = report.failed,
            unchanged = report.unchanged,
            "Rebalance complete"
        );
        report
    }

    /// Retry queued rebalance pushes. Returns how many went through.
    pub async fn retry_pending(&self) -> usize {
        let queued: Vec<PendingPush> = std::mem::take(&mut *self.pending.lock());
        if queued.is_empty() {
            return 0;
        }

        let mut succeeded = 0;
        let mut still_failing = Vec::new();
        let mut delivered: HashMap<String, u64> = HashMap::new();

        for push in queued {
            let Some(entry) = self.store.peek(&push.id) else {
                continue;
            };
            if !self.replica_set(&push.id).contains(&push.to) {
                continue;
            }
            let message = self.snapshot_message(&entry);
            match self.pusher.push(&push.to, &message).await {
                Ok(_) => {
                    succeeded += 1;
                    Metrics::incr(&self.metrics.rebalance_pushes);
                    delivered.insert(push.id.clone(), entry.version);
                }
                Err(_) => still_failing.push(push),
            }
        }

        for (id, version) in delivered {
            let waiting = still_failing.iter().any(|p| p.id == id);
            let current = self.replica_set(&id);
            if waiting {
                continue;
            }
            if current.contains(&self.local) {
                self.placements.insert(id, current);
            } else if self.store.release(&id, version) {
                self.placements.remove(&id);
            }
        }

        if !still_failing.is_empty() {
            debug!(remaining = still_failing.len(), "Rebalance pushes still failing");
            let mut pending = self.pending.lock();
            for push in still_failing {
                if !pending.contains(&push) {
                    pending.push(push);
                }
            }
        }
        succeeded
    }

    fn snapshot_message(&self, entry: &SessionEntry) -> ReplicationMessage {
        ReplicationMessage {
            id: entry.id.clone(),
            mutation: Mutation::Sync {
                entry: entry.clone(),
            },
            version: entry.version,
            origin: self.local.clone(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Drain queued backups, then stop accepting operations.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flush_backups().await;
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        info!(member = %self.local, "Replication manager stopped");
    }

    /// Whether `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ReplicationManager {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

impl std::fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationManager")
            .field("local", &self.local)
            .field("store", &self.store)
            .field("backup_mode", &self.config.backup_mode)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
