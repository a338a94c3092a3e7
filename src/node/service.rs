//! Node service: opens the change state and serves it over HTTP

use std::sync::Arc;

use crate::common::{Error, LogBackend, NodeConfig, Result};
use crate::node::applicator::ChangeApplicator;
use crate::node::config_store::{
    ConfigSnapshot, ConfigStorage, FileConfigStorage, MemoryConfigStorage,
};
use crate::node::http::{create_router, NodeHttpState};
use crate::node::log::{ChangeLog, FileChangeLog, MemoryChangeLog};
use crate::node::server::NomadServer;
use crate::node::state::ServerState;
use crate::node::sync::SynchronizedServer;

/// Open the node state described by `config`
pub fn open_server<T: ConfigSnapshot>(
    config: &NodeConfig,
    applicator: Arc<dyn ChangeApplicator<T>>,
) -> Result<Arc<SynchronizedServer<T>>> {
    let (log, configs): (Box<dyn ChangeLog>, Box<dyn ConfigStorage<T>>) = match config.log_backend
    {
        LogBackend::Memory => (
            Box::new(MemoryChangeLog::new()),
            Box::new(MemoryConfigStorage::new()),
        ),
        LogBackend::File => (
            Box::new(FileChangeLog::open(config.log_path(), config.wal_sync)?),
            Box::new(FileConfigStorage::open(config.config_dir())?),
        ),
        #[cfg(feature = "sled-backend")]
        LogBackend::Sled => (
            Box::new(crate::node::log::SledChangeLog::open(
                config.sled_path(),
                config.wal_sync,
            )?),
            Box::new(FileConfigStorage::open(config.config_dir())?),
        ),
        #[cfg(not(feature = "sled-backend"))]
        LogBackend::Sled => {
            return Err(Error::InvalidConfig(
                "sled backend requires the `sled-backend` feature".into(),
            ))
        }
    };

    let state = ServerState::open(log, configs)?;
    Ok(Arc::new(SynchronizedServer::new(NomadServer::new(
        state, applicator,
    ))))
}

pub struct NodeService<T: ConfigSnapshot> {
    config: NodeConfig,
    server: Arc<SynchronizedServer<T>>,
}

impl<T: ConfigSnapshot> NodeService<T> {
    pub fn open(config: NodeConfig, applicator: Arc<dyn ChangeApplicator<T>>) -> Result<Self> {
        let server = open_server(&config, applicator)?;
        Ok(Self { config, server })
    }

    pub fn server(&self) -> Arc<SynchronizedServer<T>> {
        Arc::clone(&self.server)
    }

    /// Serve until the listener fails or ctrl-c is received
    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting node: {}", self.config.node_name);
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  Data path: {}", self.config.data_dir.display());
        tracing::info!("  Log backend: {:?}", self.config.log_backend);

        let server = self.server;
        if server.has_incomplete_change().await? {
            tracing::warn!("Node holds an incomplete change, run a repair");
        }

        let router = create_router(NodeHttpState {
            node_name: self.config.node_name.clone(),
            server,
        });

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("✓ Node ready");

        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown requested");
            })
            .await
            .map_err(|e| Error::Internal(format!("HTTP server error: {}", e)))
    }
}
