//! Place command - shows owner and backups for session ids.

use anyhow::{Result, bail};
use clap::Args;
use console::Style;
use serde::Serialize;
use sessionmesh_store::{ClusterView, MemberId, StaticClusterView};

use super::Context;

/// Arguments for the place command.
#[derive(Args, Debug)]
pub struct PlaceArgs {
    /// Session ids to place
    #[arg(required = true)]
    pub ids: Vec<String>,

    /// Member list (overrides cluster.members)
    #[arg(short, long, value_delimiter = ',')]
    pub members: Vec<String>,
}

/// Placement of one id for JSON output.
#[derive(Debug, Serialize)]
struct Placement {
    id: String,
    owner: Option<MemberId>,
    backups: Vec<MemberId>,
}

/// Run the place command.
pub async fn run(args: PlaceArgs, ctx: &Context) -> Result<()> {
    let loaded = ctx.load_config()?;
    let cluster = loaded.config.cluster();
    let backup_count = loaded.config.replication().backup_count;

    let members: Vec<MemberId> = if args.members.is_empty() {
        cluster.members.into_iter().map(MemberId::from).collect()
    } else {
        args.members.into_iter().map(MemberId::from).collect()
    };
    let Some(local) = members.first().cloned() else {
        bail!("no members: set cluster.members or pass --members");
    };

    let view =
        StaticClusterView::with_virtual_nodes(local, members, backup_count, cluster.virtual_nodes);
    let placements: Vec<Placement> = args
        .ids
        .into_iter()
        .map(|id| Placement {
            owner: view.owner(&id),
            backups: view.backups(&id),
            id,
        })
        .collect();

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&placements)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    for placement in &placements {
        let owner = placement
            .owner
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".to_string());
        let backups = placement
            .backups
            .iter()
            .map(MemberId::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{:<38} {} {:<12} {} {}",
            placement.id,
            dim.apply_to("owner"),
            owner,
            dim.apply_to("backups"),
            if backups.is_empty() { "-" } else { backups.as_str() }
        );
    }

    Ok(())
}
