//! CLI command handlers.

pub mod config;
pub mod place;
pub mod simulate;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use sessionmesh_config::{ConfigSource, LoadedConfig, MeshConfig, ReplicationMode};
use sessionmesh_store::{BackupMode, StoreConfig};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Explicit config file, bypassing discovery.
    pub config_file: Option<PathBuf>,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Load the explicit config file, or discover and merge the layers.
    pub fn load_config(&self) -> Result<LoadedConfig> {
        let Some(ref path) = self.config_file else {
            return Ok(sessionmesh_config::load_config(None)?);
        };

        let config = sessionmesh_config::load_config_file(path)?;
        config.validate()?;
        let source = ConfigSource {
            path: path.clone(),
            loaded: true,
        };
        Ok(LoadedConfig {
            config,
            sources: vec![source.clone()],
            source: Some(source),
            warnings: Vec::new(),
        })
    }
}

/// Translate the file config into store settings.
pub fn store_config(config: &MeshConfig) -> StoreConfig {
    let store = config.store();
    let replication = config.replication();

    let mut store_config = StoreConfig::new()
        .with_idle_timeout(Duration::from_secs(store.idle_timeout_secs))
        .with_max_entries(store.max_entries)
        .with_eviction_scan_interval(Duration::from_secs(store.eviction_scan_interval_secs))
        .with_eviction_task(store.enable_eviction_task)
        .with_touch_on_read(store.touch_on_read)
        .with_backup_count(replication.backup_count)
        .with_backup_mode(match replication.mode {
            ReplicationMode::Async => BackupMode::Async,
            ReplicationMode::Sync => BackupMode::Sync,
        })
        .with_retries(
            replication.max_retries,
            Duration::from_millis(replication.retry_backoff_ms),
        )
        .with_send_timeout(Duration::from_millis(replication.send_timeout_ms))
        .with_operation_timeout(Duration::from_millis(replication.operation_timeout_ms));

    if let Some(ttl) = store.time_to_live_secs {
        store_config = store_config.with_time_to_live(Duration::from_secs(ttl));
    }

    store_config
}
