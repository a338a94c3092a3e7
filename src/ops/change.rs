//! Apply one configuration change across the cluster

use serde::Serialize;

use crate::client::{
    Consistency, FailureRecorder, LoggingResultReceiver, MuxResultReceiver, NomadClient,
    ResultReceiver,
};
use crate::common::{Change, Error, Result};
use crate::node::ConfigSnapshot;

#[derive(Debug, Clone, Serialize)]
pub struct ChangeReport {
    pub change: String,
    pub consistency: Consistency,
    pub committed_nodes: Vec<String>,
    /// Per-node failures, when the change committed on only part of the cluster
    pub failures: Vec<String>,
}

#[derive(Debug, Default)]
struct CommitTracker {
    committed: Vec<String>,
}

impl<T> ResultReceiver<T> for CommitTracker {
    fn committed(&mut self, node: &str) {
        self.committed.push(node.to_string());
    }
}

/// Apply `change` and report the outcome.
///
/// A change that committed nowhere is an error listing every node's
/// failure. A change that committed on some nodes is reported with its
/// verdict, since running it again cannot help: the operator must repair.
pub async fn apply_change<T: ConfigSnapshot>(
    client: &NomadClient<T>,
    change: Change,
) -> Result<ChangeReport> {
    tracing::info!("Starting configuration change: {}", change);
    let summary = change.summary();

    let mut recorder = FailureRecorder::new();
    let mut logger = LoggingResultReceiver;
    let mut tracker = CommitTracker::default();
    let consistency = {
        let mut receiver = MuxResultReceiver::new(vec![
            &mut recorder as &mut dyn ResultReceiver<T>,
            &mut logger,
            &mut tracker,
        ]);
        client.try_apply_change(&mut receiver, change).await
    };

    if !tracker.committed.is_empty() {
        return Ok(ChangeReport {
            change: summary,
            consistency,
            committed_nodes: tracker.committed,
            failures: recorder.failures().to_vec(),
        });
    }

    let mut failures = recorder.failures().to_vec();
    if failures.is_empty() {
        failures.push(format!("Change was not committed: cluster is {}", consistency));
    }
    Err(Error::ChangeFailed {
        consistency,
        failures,
    })
}
