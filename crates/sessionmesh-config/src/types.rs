//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [store]          # expiry and size bounds
//! [replication]    # backups, retries, deadlines
//! [cluster]        # name, local member, static member list
//! [cookie]         # session cookie settings for the HTTP layer
//! [logging]        # log level and file output
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Entry store settings.
    pub store: Option<StoreSection>,

    /// Replication settings.
    pub replication: Option<ReplicationSection>,

    /// Cluster membership settings.
    pub cluster: Option<ClusterSection>,

    /// Session cookie settings.
    pub cookie: Option<CookieSection>,

    /// Logging settings.
    pub logging: Option<LoggingSection>,
}

impl MeshConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Config with every section populated with defaults.
    pub fn with_defaults() -> Self {
        Self {
            store: Some(StoreSection::default()),
            replication: Some(ReplicationSection::default()),
            cluster: Some(ClusterSection::default()),
            cookie: Some(CookieSection::default()),
            logging: Some(LoggingSection::default()),
        }
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: MeshConfig) {
        if other.store.is_some() {
            self.store = other.store;
        }

        if other.replication.is_some() {
            self.replication = other.replication;
        }

        if other.cluster.is_some() {
            self.cluster = other.cluster;
        }

        if other.cookie.is_some() {
            self.cookie = other.cookie;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Store section, or defaults.
    pub fn store(&self) -> StoreSection {
        self.store.clone().unwrap_or_default()
    }

    /// Replication section, or defaults.
    pub fn replication(&self) -> ReplicationSection {
        self.replication.clone().unwrap_or_default()
    }

    /// Cluster section, or defaults.
    pub fn cluster(&self) -> ClusterSection {
        self.cluster.clone().unwrap_or_default()
    }

    /// Cookie section, or defaults.
    pub fn cookie(&self) -> CookieSection {
        self.cookie.clone().unwrap_or_default()
    }

    /// Logging section, or defaults.
    pub fn logging(&self) -> LoggingSection {
        self.logging.clone().unwrap_or_default()
    }

    /// Reject values the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        let store = self.store();
        if store.idle_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "store.idle_timeout_secs",
                "must be greater than zero",
            ));
        }
        if store.time_to_live_secs == Some(0) {
            return Err(ConfigError::invalid(
                "store.time_to_live_secs",
                "must be greater than zero when set",
            ));
        }
        if store.max_entries == 0 {
            return Err(ConfigError::invalid(
                "store.max_entries",
                "must be greater than zero",
            ));
        }
        if store.eviction_scan_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "store.eviction_scan_interval_secs",
                "must be greater than zero",
            ));
        }

        let replication = self.replication();
        if replication.send_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "replication.send_timeout_ms",
                "must be greater than zero",
            ));
        }
        if replication.operation_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "replication.operation_timeout_ms",
                "must be greater than zero",
            ));
        }

        let cluster = self.cluster();
        if cluster.name.trim().is_empty() {
            return Err(ConfigError::invalid("cluster.name", "must not be empty"));
        }
        if cluster.virtual_nodes == 0 {
            return Err(ConfigError::invalid(
                "cluster.virtual_nodes",
                "must be at least 1",
            ));
        }
        if let Some(ref member_id) = cluster.member_id
            && !cluster.members.is_empty()
            && !cluster.members.contains(member_id)
        {
            return Err(ConfigError::invalid(
                "cluster.member_id",
                format!("'{member_id}' is not listed in cluster.members"),
            ));
        }

        let cookie = self.cookie();
        if cookie.name.trim().is_empty() {
            return Err(ConfigError::invalid("cookie.name", "must not be empty"));
        }

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Entry store configuration.
///
/// ```toml
/// [store]
/// idle_timeout_secs = 1800
/// max_entries = 10000
/// eviction_scan_interval_secs = 60
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Inactivity after which a session expires.
    pub idle_timeout_secs: u64,
    /// Absolute lifetime measured from creation. Unset means no limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_live_secs: Option<u64>,
    /// Maximum sessions owned per node before LRU eviction.
    pub max_entries: usize,
    /// Interval in seconds between eviction scans.
    pub eviction_scan_interval_secs: u64,
    /// Whether the periodic eviction scan runs.
    pub enable_eviction_task: bool,
    /// Whether reads refresh the idle timer.
    pub touch_on_read: bool,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1800,
            time_to_live_secs: None,
            max_entries: 10_000,
            eviction_scan_interval_secs: 60,
            enable_eviction_task: true,
            touch_on_read: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replication Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// How writes wait on their backups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Acknowledge after the owner applies; push backups in the background.
    #[default]
    Async,
    /// Await backup pushes before acknowledging.
    Sync,
}

/// Replication configuration.
///
/// ```toml
/// [replication]
/// backup_count = 1
/// mode = "async"
/// max_retries = 3
/// retry_backoff_ms = 100
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    /// Backup replicas per session.
    pub backup_count: usize,
    /// Backup acknowledgement mode.
    pub mode: ReplicationMode,
    /// Retries for a failed backup push.
    pub max_retries: u32,
    /// Initial backoff between retries, doubled each attempt.
    pub retry_backoff_ms: u64,
    /// Time box for a single push attempt.
    pub send_timeout_ms: u64,
    /// Default read/write deadline.
    pub operation_timeout_ms: u64,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            backup_count: 1,
            mode: ReplicationMode::Async,
            max_retries: 3,
            retry_backoff_ms: 100,
            send_timeout_ms: 1000,
            operation_timeout_ms: 5000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cluster Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Cluster configuration.
///
/// The member list is static; membership discovery is left to the
/// deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Cluster name; nodes with different names never share sessions.
    pub name: String,
    /// This node's member id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    /// Static member list.
    pub members: Vec<String>,
    /// Consistent-hash points per member.
    pub virtual_nodes: usize,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            name: "session-cluster".to_string(),
            member_id: None,
            members: Vec::new(),
            virtual_nodes: 64,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cookie Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Session cookie settings consumed by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieSection {
    /// Cookie name carrying the session id.
    pub name: String,
    /// Cookie path.
    pub path: String,
    /// Cookie max-age. Unset means it follows the idle timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
    /// Whether the cookie is HTTP-only.
    pub http_only: bool,
    /// Whether the cookie requires HTTPS.
    pub secure: bool,
}

impl CookieSection {
    /// Max-age to send, given the store's idle timeout.
    pub fn effective_max_age(&self, idle_timeout_secs: u64) -> u64 {
        self.max_age_secs.unwrap_or(idle_timeout_secs)
    }
}

impl Default for CookieSection {
    fn default() -> Self {
        Self {
            name: "SESSIONMESH_SESSIONID".to_string(),
            path: "/".to_string(),
            max_age_secs: None,
            http_only: true,
            secure: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default level filter when `RUST_LOG` is unset.
    pub level: String,
    /// Whether to write JSON logs to a daily rolling file.
    pub file: bool,
    /// Directory for log files. Defaults to the platform data dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: true,
            dir: None,
        }
    }
}
