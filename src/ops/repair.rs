//! Repair a cluster left in an incomplete state

use serde::Serialize;

use crate::client::{
    Consistency, FailureRecorder, LoggingResultReceiver, MuxResultReceiver, NomadClient,
    ResultReceiver,
};
use crate::common::{ChangeState, Error, Result};
use crate::node::ConfigSnapshot;

#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub consistency: Consistency,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub source: String,
    pub target: String,
    pub changes_replayed: usize,
    pub current_version: u64,
    pub highest_version: u64,
}

/// Commit or roll back a change left prepared on some nodes.
///
/// `forced_state` decides when no node carries evidence of the change's fate.
pub async fn repair_cluster<T: ConfigSnapshot>(
    client: &NomadClient<T>,
    forced_state: Option<ChangeState>,
) -> Result<RepairReport> {
    if forced_state == Some(ChangeState::Prepared) {
        return Err(Error::InvalidConfig(
            "forced state must be COMMITTED or ROLLED_BACK".into(),
        ));
    }
    tracing::info!("Starting cluster repair");

    let mut recorder = FailureRecorder::new();
    let mut logger = LoggingResultReceiver;
    let consistency = {
        let mut receiver = MuxResultReceiver::new(vec![
            &mut recorder as &mut dyn ResultReceiver<T>,
            &mut logger,
        ]);
        client.try_recovery(&mut receiver, forced_state).await
    };
    finish(consistency, recorder).map(|consistency| RepairReport { consistency })
}

/// Claim every node for this client, invalidating other clients' sessions
pub async fn takeover_cluster<T: ConfigSnapshot>(client: &NomadClient<T>) -> Result<RepairReport> {
    tracing::info!("Starting cluster takeover");

    let mut recorder = FailureRecorder::new();
    let mut logger = LoggingResultReceiver;
    let consistency = {
        let mut receiver = MuxResultReceiver::new(vec![
            &mut recorder as &mut dyn ResultReceiver<T>,
            &mut logger,
        ]);
        client.try_takeover(&mut receiver).await
    };
    finish(consistency, recorder).map(|consistency| RepairReport { consistency })
}

fn finish(consistency: Consistency, recorder: FailureRecorder) -> Result<Consistency> {
    if consistency.is_consistent() {
        return Ok(consistency);
    }
    recorder.reraise()?;
    Err(Error::ChangeFailed {
        consistency,
        failures: vec![format!("Cluster is {}", consistency)],
    })
}

/// Bring `target` in line with `source` by replaying its change history
pub async fn sync_node<T: ConfigSnapshot>(
    client: &NomadClient<T>,
    source: &str,
    target: &str,
) -> Result<SyncReport> {
    let source_endpoint = client
        .endpoint(source)
        .ok_or_else(|| Error::InvalidConfig(format!("unknown source node: {}", source)))?;
    let target_endpoint = client
        .endpoint(target)
        .ok_or_else(|| Error::InvalidConfig(format!("unknown target node: {}", target)))?;
    if source == target {
        return Err(Error::InvalidConfig("source and target must differ".into()));
    }

    tracing::info!("Syncing node {} from {}", target, source);
    let history = source_endpoint.change_history().await?;
    let changes_replayed = history.len();
    target_endpoint.force_sync(history).await?;

    let discovery = target_endpoint.discover().await?;
    tracing::info!(
        "Node {} synced: {} change(s), version {}",
        target,
        changes_replayed,
        discovery.current_version
    );
    Ok(SyncReport {
        source: source.to_string(),
        target: target.to_string(),
        changes_replayed,
        current_version: discovery.current_version,
        highest_version: discovery.highest_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{LocalEndpoint, NomadEndpoint};
    use crate::cluster::{ClusterConfig, ClusterConfigApplicator};
    use crate::node::{MemoryChangeLog, MemoryConfigStorage, NomadServer, ServerState, SynchronizedServer};
    use std::sync::Arc;
    use std::time::Duration;

    fn client(names: &[&str]) -> NomadClient<ClusterConfig> {
        let endpoints = names
            .iter()
            .map(|name| {
                let state = ServerState::open(
                    Box::new(MemoryChangeLog::new()),
                    Box::new(MemoryConfigStorage::new()),
                )
                .unwrap();
                let server = NomadServer::new(state, Arc::new(ClusterConfigApplicator::new(*name)));
                Arc::new(LocalEndpoint::new(*name, Arc::new(SynchronizedServer::new(server))))
                    as Arc<dyn NomadEndpoint<ClusterConfig>>
            })
            .collect();
        NomadClient::new(endpoints, "ops-box", "alice", Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_repair_healthy_cluster() {
        let client = client(&["a", "b"]);
        let report = repair_cluster(&client, None).await.unwrap();
        assert_eq!(report.consistency, Consistency::Consistent);
        assert!(repair_cluster(&client, Some(ChangeState::Prepared)).await.is_err());
    }

    #[tokio::test]
    async fn test_takeover_cluster() {
        let client = client(&["a", "b"]);
        let report = takeover_cluster(&client).await.unwrap();
        assert_eq!(report.consistency, Consistency::Consistent);
    }

    #[tokio::test]
    async fn test_sync_unknown_node() {
        let client = client(&["a", "b"]);
        assert!(sync_node(&client, "a", "z").await.is_err());
        assert!(sync_node(&client, "a", "a").await.is_err());

        let report = sync_node(&client, "a", "b").await.unwrap();
        assert_eq!(report.changes_replayed, 0);
        assert_eq!(report.current_version, 0);
    }
}
