//! CLI for cluster configuration changes

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use minicfg::client::NomadClient;
use minicfg::cluster::ClusterConfig;
use minicfg::common::{parse_duration, Change, ChangeState, Config};
use minicfg::ops::{
    apply_change, diagnose_cluster, repair_cluster, sync_node, takeover_cluster, ChangeReport,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "minicfg")]
#[command(about = "minicfg cluster configuration CLI")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./minicfg.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node URLs, comma separated
    #[arg(long, value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Per-call timeout (e.g. 500ms, 5s)
    #[arg(long)]
    timeout: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ForcedState {
    Commit,
    Rollback,
}

#[derive(Subcommand)]
enum Commands {
    /// Activate a new cluster on every node
    Activate {
        /// Cluster name
        #[arg(long)]
        cluster: String,

        /// Node names, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,
    },

    /// Set one or more settings (name=value)
    Set {
        #[arg(required = true)]
        settings: Vec<String>,
    },

    /// Unset one or more settings
    Unset {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Add a node to the cluster
    Attach {
        node: String,
    },

    /// Remove a node from the cluster
    Detach {
        node: String,
    },

    /// Show the state of every node
    Diagnose {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resolve a change left prepared by an interrupted client
    Repair {
        /// Outcome to force when the nodes carry no evidence
        #[arg(long, value_enum)]
        force: Option<ForcedState>,
    },

    /// Claim every node, invalidating other clients' sessions
    Takeover,

    /// Replay one node's change history onto another
    Sync {
        /// Source node URL
        #[arg(long)]
        source: String,

        /// Target node URL
        #[arg(long)]
        target: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    let log_level = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .init();

    let mut client_config = config.client.unwrap_or_default();
    if !cli.endpoints.is_empty() {
        client_config.endpoints = cli.endpoints.clone();
    }
    if let Some(timeout) = &cli.timeout {
        client_config.timeout_ms = parse_duration(timeout)?.as_millis() as u64;
    }
    if client_config.endpoints.is_empty() {
        bail!("no endpoints: pass --endpoints or set client.endpoints");
    }
    let client = NomadClient::<ClusterConfig>::from_config(&client_config)?;

    match cli.command {
        Commands::Activate { cluster, nodes } => {
            print_change(apply_change(&client, Change::activation(cluster, nodes)).await?);
        }

        Commands::Set { settings } => {
            let changes = settings
                .iter()
                .map(|setting| match setting.split_once('=') {
                    Some((name, value)) if !name.is_empty() => Ok(Change::set(name, value)),
                    _ => bail!("expected name=value, got: {}", setting),
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            print_change(apply_change(&client, combine(changes)).await?);
        }

        Commands::Unset { names } => {
            let changes = names.into_iter().map(Change::unset).collect();
            print_change(apply_change(&client, combine(changes)).await?);
        }

        Commands::Attach { node } => {
            print_change(apply_change(&client, Change::NodeAddition { node }).await?);
        }

        Commands::Detach { node } => {
            print_change(apply_change(&client, Change::NodeRemoval { node }).await?);
        }

        Commands::Diagnose { json } => {
            let report = diagnose_cluster(&client).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Cluster state: {}", report.global_state);
                for node in &report.nodes {
                    if !node.reachable {
                        println!("  {}: unreachable", node.node);
                        continue;
                    }
                    println!(
                        "  {}: mode {}, version {}/{}, count {}",
                        node.node,
                        node.mode.map(|m| m.to_string()).unwrap_or_default(),
                        node.current_version.unwrap_or(0),
                        node.highest_version.unwrap_or(0),
                        node.mutative_message_count.unwrap_or(0)
                    );
                    if let Some(latest) = &node.latest_change {
                        println!(
                            "    latest change: {} {} (v{}) {}",
                            latest.change_uuid, latest.state, latest.version, latest.summary
                        );
                    }
                }
                if let Some(failure) = &report.discover_failure {
                    println!("  Discovery failure: {}", failure);
                }
                if report.needs_repair() {
                    println!("Run `minicfg repair` to resolve the cluster state");
                }
            }
        }

        Commands::Repair { force } => {
            let forced_state = force.map(|f| match f {
                ForcedState::Commit => ChangeState::Committed,
                ForcedState::Rollback => ChangeState::RolledBack,
            });
            let report = repair_cluster(&client, forced_state).await?;
            println!("Repair complete: cluster is {}", report.consistency);
        }

        Commands::Takeover => {
            let report = takeover_cluster(&client).await?;
            println!("Takeover complete: cluster is {}", report.consistency);
        }

        Commands::Sync { source, target } => {
            let report = sync_node(&client, &source, &target).await?;
            println!("Sync report:");
            println!("  Source: {}", report.source);
            println!("  Target: {}", report.target);
            println!("  Changes replayed: {}", report.changes_replayed);
            println!("  Current version: {}", report.current_version);
            println!("  Highest version: {}", report.highest_version);
        }
    }

    Ok(())
}

fn combine(mut changes: Vec<Change>) -> Change {
    if changes.len() == 1 {
        changes.remove(0)
    } else {
        Change::Multi { changes }
    }
}

fn print_change(report: ChangeReport) {
    println!("Change: {}", report.change);
    println!("  Consistency: {}", report.consistency);
    println!("  Committed on: {}", report.committed_nodes.join(", "));
    for failure in &report.failures {
        println!("  Failure: {}", failure);
    }
}
