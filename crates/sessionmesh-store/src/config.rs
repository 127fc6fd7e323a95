//! Configuration for the session store.

use std::time::Duration;

use crate::expiry::ExpiryPolicy;

/// Default idle timeout (30 minutes).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1800);

/// Default maximum number of owned entries per node before LRU eviction.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Default number of backup replicas per session.
pub const DEFAULT_BACKUP_COUNT: usize = 1;

/// Default interval between eviction scans.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Default retry budget for a single backup push.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default initial backoff between backup push retries.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Default time box for one backup push attempt.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Default deadline for reads and writes.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// How writes wait on their backups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupMode {
    /// Acknowledge once the owner has applied the write; backups are pushed
    /// by a background worker.
    #[default]
    Async,
    /// Await every backup push before acknowledging. Failed pushes are
    /// reported as `WriteOutcome::PartialFailure`.
    Sync,
}

/// Configuration for the session store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Inactivity after which an entry expires (per-entry overrides allowed).
    pub idle_timeout: Duration,

    /// Optional absolute lifetime measured from creation.
    pub time_to_live: Option<Duration>,

    /// Maximum number of entries this node owns before LRU eviction.
    pub max_entries: usize,

    /// Number of backup replicas kept for every entry.
    pub backup_count: usize,

    /// Interval for the background eviction scan.
    pub eviction_scan_interval: Duration,

    /// Whether to run the periodic eviction task.
    /// If false, expired entries are only removed by explicit scans.
    pub enable_eviction_task: bool,

    /// Whether reads refresh the idle timer.
    pub touch_on_read: bool,

    /// How writes wait on backup propagation.
    pub backup_mode: BackupMode,

    /// Retries for a failed backup push before it is dropped.
    pub max_retries: u32,

    /// Initial backoff between push retries (doubles each attempt).
    pub retry_backoff: Duration,

    /// Time box for a single push attempt.
    pub send_timeout: Duration,

    /// Default deadline for reads and writes.
    pub operation_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            time_to_live: None,
            max_entries: DEFAULT_MAX_ENTRIES,
            backup_count: DEFAULT_BACKUP_COUNT,
            eviction_scan_interval: DEFAULT_SCAN_INTERVAL,
            enable_eviction_task: true,
            touch_on_read: true,
            backup_mode: BackupMode::Async,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set an absolute time-to-live measured from creation.
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Disable the absolute time-to-live.
    pub fn without_time_to_live(mut self) -> Self {
        self.time_to_live = None;
        self
    }

    /// Set the maximum number of owned entries.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Set the number of backups per entry.
    pub fn with_backup_count(mut self, count: usize) -> Self {
        self.backup_count = count;
        self
    }

    /// Set the eviction scan interval.
    pub fn with_eviction_scan_interval(mut self, interval: Duration) -> Self {
        self.eviction_scan_interval = interval;
        self
    }

    /// Enable or disable the background eviction task.
    pub fn with_eviction_task(mut self, enabled: bool) -> Self {
        self.enable_eviction_task = enabled;
        self
    }

    /// Enable or disable touch-on-read.
    pub fn with_touch_on_read(mut self, enabled: bool) -> Self {
        self.touch_on_read = enabled;
        self
    }

    /// Set the backup mode.
    pub fn with_backup_mode(mut self, mode: BackupMode) -> Self {
        self.backup_mode = mode;
        self
    }

    /// Set the retry budget and initial backoff for backup pushes.
    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    /// Set the per-attempt time box for backup pushes.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the default read/write deadline.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Expiry rules derived from this configuration.
    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::new(self.idle_timeout, self.time_to_live)
    }
}
