use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use minicfg::cluster::{ClusterConfig, ClusterConfigApplicator};
use minicfg::common::{Config, LogBackend, NodeConfig};
use minicfg::node::NodeService;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "minicfg-node")]
#[command(about = "minicfg node - serves one node's configuration change log")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./minicfg.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the node API
    Serve {
        /// Node name; must match the name used in cluster activation
        #[arg(long)]
        name: Option<String>,

        /// HTTP address to listen on
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Data directory for the change log and config snapshots
        #[arg(long)]
        data: Option<PathBuf>,

        /// Change log backend (memory, file, sled)
        #[arg(long)]
        backend: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    let log_level = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            name,
            bind,
            data,
            backend,
        } => {
            let mut node = config.node.unwrap_or_default();
            if let Some(name) = name {
                node.node_name = name;
            }
            if let Some(bind) = bind {
                node.bind_addr = bind;
            }
            if let Some(data) = data {
                node.data_dir = data;
            }
            if let Some(backend) = backend {
                node.log_backend = backend.parse::<LogBackend>()?;
            }
            serve(node).await?;
        }
    }

    Ok(())
}

async fn serve(node: NodeConfig) -> Result<()> {
    if node.log_backend != LogBackend::Memory {
        tokio::fs::create_dir_all(&node.data_dir).await?;
    }

    let applicator = ClusterConfigApplicator::new(node.node_name.clone());
    let service = NodeService::<ClusterConfig>::open(node, Arc::new(applicator.clone()))?;

    // the runtime view starts from the last committed config
    let committed = service
        .server()
        .discover()
        .await?
        .latest_committed_change
        .and_then(|change| change.change_result);
    if let Some(config) = &committed {
        tracing::info!(
            "Cluster {} at revision {} with nodes: {}",
            config.name,
            config.revision,
            config.nodes.join(", ")
        );
    } else {
        tracing::info!("Node is not activated yet");
    }
    applicator.set_runtime(committed);

    service.serve().await?;
    Ok(())
}
