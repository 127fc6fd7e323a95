//! Configuration system for SessionMesh.
//!
//! Provides TOML-based configuration with:
//! - Store, replication, cluster, cookie and logging sections
//! - Config file layering (user config dir + project-local overrides)
//! - Validation of values the store cannot run with

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, PROJECT_CONFIG_FILE, config_dir, load_config, load_config_file,
    load_config_with_options, save_config, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
