//! Simulate command - runs an in-process cluster over the local transport.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;
use console::{Style, style};
use serde::Serialize;
use sessionmesh_store::{
    LocalTransport, ManualClock, MemberId, RebalanceReport, SessionStore, StaticClusterView,
    StoreStats, WriteOutcome,
};
use tracing::info;

use super::{Context, store_config};

/// Arguments for the simulate command.
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of nodes (defaults to cluster.members, or 3)
    #[arg(short, long)]
    pub nodes: Option<usize>,

    /// Number of sessions to write
    #[arg(short, long, default_value_t = 100)]
    pub sessions: usize,

    /// Backups per session (overrides replication.backup_count)
    #[arg(long)]
    pub backups: Option<usize>,

    /// Skip removing a node after the writes
    #[arg(long)]
    pub no_failover: bool,

    /// Advance the clock past the idle timeout and run eviction
    #[arg(long)]
    pub expire: bool,
}

/// One simulated member.
struct SimNode {
    id: MemberId,
    view: Arc<StaticClusterView>,
    store: SessionStore,
}

/// Outcome of removing a member.
#[derive(Debug, Serialize)]
struct FailoverReport {
    failed_member: MemberId,
    rebalance: RebalanceReport,
    recovered: usize,
    lost: usize,
}

/// Outcome of the expiry pass.
#[derive(Debug, Serialize)]
struct ExpiryReport {
    advanced_secs: u64,
    expired: usize,
    orphans_dropped: usize,
    remaining: usize,
}

/// Simulation result for JSON output.
#[derive(Debug, Serialize)]
struct SimulationReport {
    members: Vec<MemberId>,
    backup_count: usize,
    sessions: usize,
    acknowledged: usize,
    partial_failures: usize,
    readable: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    failover: Option<FailoverReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expiry: Option<ExpiryReport>,
    nodes: Vec<StoreStats>,
}

/// Run the simulate command.
pub async fn run(args: SimulateArgs, ctx: &Context) -> Result<()> {
    let loaded = ctx.load_config()?;
    let mesh = &loaded.config;

    let mut config = store_config(mesh).with_eviction_task(false);
    if let Some(backups) = args.backups {
        config = config.with_backup_count(backups);
    }

    let cluster = mesh.cluster();
    let members: Vec<MemberId> = match args.nodes {
        None if !cluster.members.is_empty() => {
            cluster.members.iter().cloned().map(MemberId::from).collect()
        }
        nodes => (1..=nodes.unwrap_or(3))
            .map(|i| MemberId::new(format!("node-{i}")))
            .collect(),
    };
    if members.is_empty() {
        bail!("a simulation needs at least one node");
    }

    let transport = Arc::new(LocalTransport::new().with_forwarding(true));
    let clock = ManualClock::starting_now();

    let nodes: Vec<SimNode> = members
        .iter()
        .map(|id| {
            let view = Arc::new(StaticClusterView::with_virtual_nodes(
                id.clone(),
                members.clone(),
                config.backup_count,
                cluster.virtual_nodes,
            ));
            let store = SessionStore::builder()
                .config(config.clone())
                .cluster(view.clone())
                .transport(transport.clone())
                .clock(Arc::new(clock.clone()))
                .build();
            transport.register(id.clone(), store.replication());
            SimNode {
                id: id.clone(),
                view,
                store,
            }
        })
        .collect();

    info!(
        members = members.len(),
        sessions = args.sessions,
        backups = config.backup_count,
        "Starting simulation"
    );

    // Writes round-robin across nodes; non-owners forward.
    let mut survivors: Vec<&SimNode> = nodes.iter().collect();
    let ids: Vec<String> = (0..args.sessions)
        .map(|_| uuid::Uuid::new_v4().to_string())
        .collect();
    let mut acknowledged = 0;
    let mut partial_failures = 0;
    for (i, id) in ids.iter().enumerate() {
        let node = &nodes[i % nodes.len()];
        match node.store.put(id, "user", format!("user-{i}").as_str()).await? {
            WriteOutcome::Acknowledged { .. } => acknowledged += 1,
            WriteOutcome::PartialFailure { .. } => partial_failures += 1,
        }
    }
    flush(&survivors).await;

    // Read each session from a different node than the one that wrote it.
    let mut readable = 0;
    for (i, id) in ids.iter().enumerate() {
        let node = &nodes[(i + 1) % nodes.len()];
        if holds(&node.store, id, i).await {
            readable += 1;
        }
    }
    // Touches from the reads replicate before anyone leaves.
    flush(&survivors).await;

    let failover = match survivors.pop() {
        Some(victim) if !args.no_failover && !survivors.is_empty() => {
            Some(fail_member(victim, &survivors, &transport, &ids).await)
        }
        Some(victim) => {
            survivors.push(victim);
            None
        }
        None => None,
    };

    let expiry = if args.expire {
        let advance = config.idle_timeout + Duration::from_secs(1);
        clock.advance(advance);
        let mut expired = 0;
        let mut orphans_dropped = 0;
        for node in &survivors {
            let report = node.store.run_eviction().await;
            expired += report.expired;
            orphans_dropped += report.orphans_dropped;
        }
        flush(&survivors).await;
        Some(ExpiryReport {
            advanced_secs: advance.as_secs(),
            expired,
            orphans_dropped,
            remaining: survivors.iter().map(|n| n.store.active_entry_count()).sum(),
        })
    } else {
        None
    };

    let report = SimulationReport {
        members: members.clone(),
        backup_count: config.backup_count,
        sessions: ids.len(),
        acknowledged,
        partial_failures,
        readable,
        failover,
        expiry,
        nodes: survivors.iter().map(|n| n.store.stats()).collect(),
    };

    for node in &nodes {
        node.store.shutdown().await;
    }

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, ctx.verbose);
    }

    Ok(())
}

/// Drop `victim` from the cluster and rebalance the survivors.
async fn fail_member(
    victim: &SimNode,
    survivors: &[&SimNode],
    transport: &LocalTransport,
    ids: &[String],
) -> FailoverReport {
    info!(member = %victim.id, "Removing member");
    transport.deregister(&victim.id);
    victim.store.shutdown().await;

    let current: Vec<MemberId> = survivors.iter().map(|n| n.id.clone()).collect();
    let events: Vec<_> = survivors
        .iter()
        .map(|node| node.view.set_members(current.clone()))
        .collect();

    let mut rebalance = RebalanceReport::default();
    for (node, event) in survivors.iter().zip(&events) {
        let report = node.store.handle_membership_change(event).await;
        rebalance.pushed += report.pushed;
        rebalance.released += report.released;
        rebalance.failed += report.failed;
        rebalance.unchanged += report.unchanged;
    }
    flush(survivors).await;

    let mut recovered = 0;
    for (i, id) in ids.iter().enumerate() {
        if holds(&survivors[i % survivors.len()].store, id, i).await {
            recovered += 1;
        }
    }

    FailoverReport {
        failed_member: victim.id.clone(),
        rebalance,
        recovered,
        lost: ids.len() - recovered,
    }
}

/// Whether `store` can read back the value written for session `i`.
async fn holds(store: &SessionStore, id: &str, i: usize) -> bool {
    let expected = format!("user-{i}");
    matches!(
        store.get_attribute(id, "user").await,
        Ok(Some(value)) if value.as_bytes() == expected.as_bytes()
    )
}

async fn flush(nodes: &[&SimNode]) {
    for node in nodes {
        node.store.flush().await;
    }
}

fn print_report(report: &SimulationReport, verbose: bool) {
    let green = Style::new().green();
    let red = Style::new().red();
    let dim = Style::new().dim();

    println!();
    println!("{}", style("SessionMesh Simulation").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!();
    println!(
        "  {} {}",
        dim.apply_to("Members:"),
        report
            .members
            .iter()
            .map(MemberId::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  {} {}", dim.apply_to("Backups:"), report.backup_count);
    println!(
        "  {} {} ({} acknowledged, {} partial)",
        dim.apply_to("Writes:"),
        report.sessions,
        report.acknowledged,
        report.partial_failures
    );
    println!(
        "  {} {}/{}",
        dim.apply_to("Cross-node reads:"),
        report.readable,
        report.sessions
    );

    if let Some(ref failover) = report.failover {
        println!();
        println!("  {} {}", dim.apply_to("Removed:"), failover.failed_member);
        println!(
            "  {} {} pushed, {} released, {} failed",
            dim.apply_to("Rebalance:"),
            failover.rebalance.pushed,
            failover.rebalance.released,
            failover.rebalance.failed
        );
        let lost = if failover.lost == 0 {
            green.apply_to(format!("● {} lost", failover.lost))
        } else {
            red.apply_to(format!("● {} lost", failover.lost))
        };
        println!(
            "  {} {} recovered, {}",
            dim.apply_to("Sessions:"),
            failover.recovered,
            lost
        );
    }

    if let Some(ref expiry) = report.expiry {
        println!();
        println!(
            "  {} advanced {}s, {} expired, {} orphans dropped, {} remaining",
            dim.apply_to("Expiry:"),
            expiry.advanced_secs,
            expiry.expired,
            expiry.orphans_dropped,
            expiry.remaining
        );
    }

    if verbose {
        println!();
        println!("{}", dim.apply_to("─".repeat(40)));
        for stats in &report.nodes {
            println!();
            println!("  {}", style(&stats.local_member).bold());
            println!(
                "    {} {} owned, {} backup, {} tombstones",
                dim.apply_to("Entries:"),
                stats.owned_entries,
                stats.backup_entries,
                stats.tombstones
            );
            println!(
                "    {} {} writes, {} forwarded, {} replicated",
                dim.apply_to("Counters:"),
                stats.counters.writes,
                stats.counters.forwarded,
                stats.counters.replicated_applied
            );
        }
    }

    println!();
}
