//! Cluster diagnostics

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::client::{
    ConsistencyAnalyzer, GlobalState, LoggingResultReceiver, MuxResultReceiver, NomadClient,
    ResultReceiver,
};
use crate::common::{ChangeDetails, ChangeState, NodeMode, Result};
use crate::node::ConfigSnapshot;

#[derive(Debug, Clone, Serialize)]
pub struct ChangeSummary {
    pub change_uuid: Uuid,
    pub state: ChangeState,
    pub version: u64,
    pub summary: String,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
}

impl<T> From<&ChangeDetails<T>> for ChangeSummary {
    fn from(details: &ChangeDetails<T>) -> Self {
        Self {
            change_uuid: details.change_uuid,
            state: details.state,
            version: details.version,
            summary: details.change.summary(),
            creation_host: details.creation_host.clone(),
            creation_user: details.creation_user.clone(),
            creation_timestamp: details.creation_timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node: String,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<NodeMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutative_message_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highest_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_mutation_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_mutation_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_change: Option<ChangeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_committed_change: Option<ChangeSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub global_state: GlobalState,
    pub nodes: Vec<NodeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discover_failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inconsistent_change: Option<Uuid>,
}

impl DiagnosticReport {
    /// Does the cluster need a `repair` run?
    pub fn needs_repair(&self) -> bool {
        !matches!(self.global_state, GlobalState::Accepting)
    }
}

/// Read-only diagnosis of every node
pub async fn diagnose_cluster<T: ConfigSnapshot>(client: &NomadClient<T>) -> Result<DiagnosticReport> {
    tracing::info!("Starting cluster diagnosis");

    let mut analyzer = ConsistencyAnalyzer::<T>::new();
    let mut logger = LoggingResultReceiver;
    {
        let mut receiver = MuxResultReceiver::new(vec![
            &mut analyzer as &mut dyn ResultReceiver<T>,
            &mut logger,
        ]);
        client.try_discovery(&mut receiver).await;
    }

    let nodes = client
        .nodes()
        .into_iter()
        .map(|node| match analyzer.response(&node) {
            Some(d) => NodeReport {
                reachable: true,
                mode: Some(d.mode),
                mutative_message_count: Some(d.mutative_message_count),
                current_version: Some(d.current_version),
                highest_version: Some(d.highest_version),
                last_mutation_host: d.last_mutation_host.clone(),
                last_mutation_user: d.last_mutation_user.clone(),
                latest_change: d.latest_change.as_ref().map(ChangeSummary::from),
                latest_committed_change: d.latest_committed_change.as_ref().map(ChangeSummary::from),
                node,
            },
            None => NodeReport {
                node,
                reachable: false,
                mode: None,
                mutative_message_count: None,
                current_version: None,
                highest_version: None,
                last_mutation_host: None,
                last_mutation_user: None,
                latest_change: None,
                latest_committed_change: None,
            },
        })
        .collect();

    let report = DiagnosticReport {
        global_state: analyzer.global_state(),
        nodes,
        discover_failure: analyzer.discover_failure().map(str::to_string),
        inconsistent_change: analyzer.inconsistent_change(),
    };
    tracing::info!("Cluster state: {}", report.global_state);
    Ok(report)
}
