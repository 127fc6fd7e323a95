//! Config command - configuration management.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};

use sessionmesh_config::{self, PROJECT_CONFIG_FILE};

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show resolved configuration
    Show,

    /// Show which config files are loaded and their precedence
    Which,

    /// Initialize a config file with defaults
    Init {
        /// Create project-local config (./sessionmesh.toml) instead of user config
        #[arg(long)]
        local: bool,
    },

    /// Show configuration file path
    Path,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx).await,
        ConfigCommand::Which => cmd_which(ctx).await,
        ConfigCommand::Init { local } => cmd_init(local).await,
        ConfigCommand::Path => cmd_path().await,
    }
}

async fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = ctx.load_config()?;
    let config = &loaded.config;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    println!("# SessionMesh Configuration\n");

    let sources = loaded.loaded_from();
    if sources.is_empty() {
        println!("No config files loaded (using defaults)\n");
    } else {
        println!("Config files:");
        for source in &sources {
            println!("  {}", source.display());
        }
        println!();
    }

    let store = config.store();
    println!("Store:");
    println!("  idle timeout: {}s", store.idle_timeout_secs);
    match store.time_to_live_secs {
        Some(ttl) => println!("  time to live: {}s", ttl),
        None => println!("  time to live: none"),
    }
    println!("  max entries: {}", store.max_entries);
    println!(
        "  eviction scan: every {}s{}",
        store.eviction_scan_interval_secs,
        if store.enable_eviction_task {
            ""
        } else {
            " (disabled)"
        }
    );
    println!();

    let replication = config.replication();
    println!("Replication:");
    println!("  backups: {}", replication.backup_count);
    println!("  mode: {:?}", replication.mode);
    println!(
        "  retries: {} (backoff {}ms)",
        replication.max_retries, replication.retry_backoff_ms
    );
    println!();

    let cluster = config.cluster();
    println!("Cluster:");
    println!("  name: {}", cluster.name);
    if let Some(ref member_id) = cluster.member_id {
        println!("  member: {}", member_id);
    }
    if !cluster.members.is_empty() {
        println!("  members: {}", cluster.members.join(", "));
    }
    println!();

    let cookie = config.cookie();
    println!("Cookie:");
    println!("  name: {}", cookie.name);
    println!(
        "  max-age: {}s",
        cookie.effective_max_age(store.idle_timeout_secs)
    );
    println!();

    if !loaded.warnings.is_empty() {
        println!("Warnings:");
        for w in &loaded.warnings {
            println!("  ⚠ {}", w);
        }
        println!();
    }

    if ctx.verbose {
        println!("---\nRaw config:\n");
        if let Ok(toml_str) = config.to_toml() {
            println!("{}", toml_str);
        }
    }

    Ok(())
}

async fn cmd_which(ctx: &Context) -> Result<()> {
    let loaded = ctx.load_config()?;

    println!("Config file search order (later overrides earlier):\n");

    for source in &loaded.sources {
        let status = if source.loaded {
            "✓ loaded"
        } else {
            "· not found"
        };
        println!("  {} {}", status, source.path.display());
    }

    println!();
    let loaded_count = loaded.loaded_from().len();
    if loaded_count == 0 {
        println!("No config files found. Run 'sessionmesh config init' to create one.");
    } else {
        println!("{} config file(s) loaded.", loaded_count);
    }

    Ok(())
}

async fn cmd_init(local: bool) -> Result<()> {
    let path = if local {
        PathBuf::from(PROJECT_CONFIG_FILE)
    } else {
        sessionmesh_config::user_config_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
    };

    if path.exists() {
        println!("Config file already exists: {}", path.display());
        return Ok(());
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let template = r#"# SessionMesh Configuration

[store]
idle_timeout_secs = 1800
max_entries = 10000
eviction_scan_interval_secs = 60
# time_to_live_secs = 86400

[replication]
backup_count = 1
mode = "async"   # or "sync" to wait for backups
max_retries = 3
retry_backoff_ms = 100

[cluster]
name = "session-cluster"
# member_id = "node-1"
# members = ["node-1", "node-2", "node-3"]

[cookie]
name = "SESSIONMESH_SESSIONID"
path = "/"

# [logging]
# level = "info"
# file = true
"#;

    std::fs::write(&path, template)?;
    println!("✓ Created config file: {}", path.display());
    println!();
    println!("Next steps:");
    println!("  sessionmesh config show        # verify configuration");
    println!("  sessionmesh simulate           # exercise an in-process cluster");

    Ok(())
}

async fn cmd_path() -> Result<()> {
    if let Some(path) = sessionmesh_config::user_config_path() {
        println!("{}", path.display());
    } else {
        eprintln!("Could not determine config directory");
    }
    Ok(())
}
