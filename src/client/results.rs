//! Result receivers
//!
//! Observers called by the orchestrator at every phase boundary and for
//! every per-node outcome. They never influence protocol decisions.
//! Every callback defaults to a no-op.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::client::Consistency;
use crate::common::{DiscoverResponse, Error, Result};

#[allow(unused_variables)]
pub trait ResultReceiver<T>: Send {
    // === Discovery ===
    fn start_discovery(&mut self, nodes: &[String]) {}
    fn discovered(&mut self, node: &str, discovery: &DiscoverResponse<T>) {}
    fn discover_fail(&mut self, node: &str, reason: &Error) {}
    fn discover_already_prepared(
        &mut self,
        node: &str,
        change_uuid: Uuid,
        creation_host: &str,
        creation_user: &str,
    ) {
    }
    fn discover_cluster_inconsistent(
        &mut self,
        change_uuid: Uuid,
        committed_nodes: &[String],
        rolled_back_nodes: &[String],
    ) {
    }
    /// Nodes grouped by the uuid of their last committed change
    fn discover_cluster_desynchronized(&mut self, partitions: &BTreeMap<Option<Uuid>, Vec<String>>) {}
    fn end_discovery(&mut self) {}

    fn start_second_discovery(&mut self) {}
    fn discover_repeated(&mut self, node: &str) {}
    fn discover_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {}
    fn end_second_discovery(&mut self) {}

    // === Prepare ===
    fn start_prepare(&mut self, change_uuid: Uuid) {}
    fn prepared(&mut self, node: &str) {}
    fn prepare_fail(&mut self, node: &str, reason: &Error) {}
    fn prepare_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {}
    fn prepare_change_unacceptable(&mut self, node: &str, rejection_reason: &str) {}
    fn end_prepare(&mut self) {}

    // === Commit ===
    fn start_commit(&mut self) {}
    fn committed(&mut self, node: &str) {}
    fn commit_fail(&mut self, node: &str, reason: &Error) {}
    fn commit_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {}
    fn end_commit(&mut self) {}

    // === Rollback ===
    fn start_rollback(&mut self) {}
    fn rolled_back(&mut self, node: &str) {}
    fn rollback_fail(&mut self, node: &str, reason: &Error) {}
    fn rollback_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {}
    fn end_rollback(&mut self) {}

    // === Takeover ===
    fn start_takeover(&mut self) {}
    fn takeover(&mut self, node: &str) {}
    fn takeover_fail(&mut self, node: &str, reason: &Error) {}
    fn takeover_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {}
    fn end_takeover(&mut self) {}

    // === Outcome ===
    fn cannot_decide_over_commit_or_rollback(&mut self) {}
    fn done(&mut self, consistency: Consistency) {}
}

/// Forwards every callback to each receiver, in registration order
pub struct MuxResultReceiver<'a, T> {
    receivers: Vec<&'a mut dyn ResultReceiver<T>>,
}

impl<'a, T> MuxResultReceiver<'a, T> {
    pub fn new(receivers: Vec<&'a mut dyn ResultReceiver<T>>) -> Self {
        Self { receivers }
    }
}

macro_rules! mux {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {
        for receiver in $self.receivers.iter_mut() {
            receiver.$method($($arg),*);
        }
    };
}

impl<T> ResultReceiver<T> for MuxResultReceiver<'_, T> {
    fn start_discovery(&mut self, nodes: &[String]) {
        mux!(self, start_discovery(nodes));
    }
    fn discovered(&mut self, node: &str, discovery: &DiscoverResponse<T>) {
        mux!(self, discovered(node, discovery));
    }
    fn discover_fail(&mut self, node: &str, reason: &Error) {
        mux!(self, discover_fail(node, reason));
    }
    fn discover_already_prepared(
        &mut self,
        node: &str,
        change_uuid: Uuid,
        creation_host: &str,
        creation_user: &str,
    ) {
        mux!(self, discover_already_prepared(node, change_uuid, creation_host, creation_user));
    }
    fn discover_cluster_inconsistent(
        &mut self,
        change_uuid: Uuid,
        committed_nodes: &[String],
        rolled_back_nodes: &[String],
    ) {
        mux!(self, discover_cluster_inconsistent(change_uuid, committed_nodes, rolled_back_nodes));
    }
    fn discover_cluster_desynchronized(&mut self, partitions: &BTreeMap<Option<Uuid>, Vec<String>>) {
        mux!(self, discover_cluster_desynchronized(partitions));
    }
    fn end_discovery(&mut self) {
        mux!(self, end_discovery());
    }
    fn start_second_discovery(&mut self) {
        mux!(self, start_second_discovery());
    }
    fn discover_repeated(&mut self, node: &str) {
        mux!(self, discover_repeated(node));
    }
    fn discover_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        mux!(self, discover_other_client(node, last_mutation_host, last_mutation_user));
    }
    fn end_second_discovery(&mut self) {
        mux!(self, end_second_discovery());
    }
    fn start_prepare(&mut self, change_uuid: Uuid) {
        mux!(self, start_prepare(change_uuid));
    }
    fn prepared(&mut self, node: &str) {
        mux!(self, prepared(node));
    }
    fn prepare_fail(&mut self, node: &str, reason: &Error) {
        mux!(self, prepare_fail(node, reason));
    }
    fn prepare_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        mux!(self, prepare_other_client(node, last_mutation_host, last_mutation_user));
    }
    fn prepare_change_unacceptable(&mut self, node: &str, rejection_reason: &str) {
        mux!(self, prepare_change_unacceptable(node, rejection_reason));
    }
    fn end_prepare(&mut self) {
        mux!(self, end_prepare());
    }
    fn start_commit(&mut self) {
        mux!(self, start_commit());
    }
    fn committed(&mut self, node: &str) {
        mux!(self, committed(node));
    }
    fn commit_fail(&mut self, node: &str, reason: &Error) {
        mux!(self, commit_fail(node, reason));
    }
    fn commit_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        mux!(self, commit_other_client(node, last_mutation_host, last_mutation_user));
    }
    fn end_commit(&mut self) {
        mux!(self, end_commit());
    }
    fn start_rollback(&mut self) {
        mux!(self, start_rollback());
    }
    fn rolled_back(&mut self, node: &str) {
        mux!(self, rolled_back(node));
    }
    fn rollback_fail(&mut self, node: &str, reason: &Error) {
        mux!(self, rollback_fail(node, reason));
    }
    fn rollback_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        mux!(self, rollback_other_client(node, last_mutation_host, last_mutation_user));
    }
    fn end_rollback(&mut self) {
        mux!(self, end_rollback());
    }
    fn start_takeover(&mut self) {
        mux!(self, start_takeover());
    }
    fn takeover(&mut self, node: &str) {
        mux!(self, takeover(node));
    }
    fn takeover_fail(&mut self, node: &str, reason: &Error) {
        mux!(self, takeover_fail(node, reason));
    }
    fn takeover_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        mux!(self, takeover_other_client(node, last_mutation_host, last_mutation_user));
    }
    fn end_takeover(&mut self) {
        mux!(self, end_takeover());
    }
    fn cannot_decide_over_commit_or_rollback(&mut self) {
        mux!(self, cannot_decide_over_commit_or_rollback());
    }
    fn done(&mut self, consistency: Consistency) {
        mux!(self, done(consistency));
    }
}

/// Traces every callback
#[derive(Debug, Default)]
pub struct LoggingResultReceiver;

impl<T> ResultReceiver<T> for LoggingResultReceiver {
    fn start_discovery(&mut self, nodes: &[String]) {
        tracing::debug!("Gathering state from nodes: {:?}", nodes);
    }
    fn discovered(&mut self, node: &str, _discovery: &DiscoverResponse<T>) {
        tracing::debug!("Received node state for: {}", node);
    }
    fn discover_fail(&mut self, node: &str, reason: &Error) {
        if reason.is_retryable() {
            tracing::warn!("Discover failed on node {} (retry once it is reachable): {}", node, reason);
        } else {
            tracing::error!("Discover failed on node {}: {}", node, reason);
        }
    }
    fn discover_already_prepared(
        &mut self,
        node: &str,
        change_uuid: Uuid,
        creation_host: &str,
        creation_user: &str,
    ) {
        tracing::warn!(
            "Another change ({}) is already underway on {}, started by {} on {}",
            change_uuid,
            node,
            creation_user,
            creation_host
        );
    }
    fn discover_cluster_inconsistent(
        &mut self,
        change_uuid: Uuid,
        committed_nodes: &[String],
        rolled_back_nodes: &[String],
    ) {
        tracing::error!(
            "UNRECOVERABLE: inconsistent config for change {}. Committed on: {:?}; rolled back on: {:?}",
            change_uuid,
            committed_nodes,
            rolled_back_nodes
        );
    }
    fn discover_cluster_desynchronized(&mut self, partitions: &BTreeMap<Option<Uuid>, Vec<String>>) {
        tracing::error!(
            "UNRECOVERABLE: desynchronized configuration, subsets: {:?}",
            partitions.values().collect::<Vec<_>>()
        );
    }
    fn end_discovery(&mut self) {
        tracing::debug!("Finished first round of gathering state");
    }
    fn start_second_discovery(&mut self) {
        tracing::debug!("Starting second round of gathering state");
    }
    fn discover_repeated(&mut self, node: &str) {
        tracing::debug!("Node state unchanged on: {}", node);
    }
    fn discover_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        tracing::warn!(
            "Another process running on {} by {} changed the state on {}",
            last_mutation_host,
            last_mutation_user,
            node
        );
    }
    fn end_second_discovery(&mut self) {
        tracing::debug!("Finished second round of gathering state");
    }
    fn start_prepare(&mut self, change_uuid: Uuid) {
        tracing::debug!("Starting a new change with UUID: {}", change_uuid);
    }
    fn prepared(&mut self, node: &str) {
        tracing::debug!("Node {} is prepared to make the change", node);
    }
    fn prepare_fail(&mut self, node: &str, reason: &Error) {
        tracing::warn!("Node {} failed to prepare the change: {}", node, reason);
    }
    fn prepare_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        tracing::warn!(
            "Another process running on {} by {} changed the state on {}",
            last_mutation_host,
            last_mutation_user,
            node
        );
    }
    fn prepare_change_unacceptable(&mut self, node: &str, rejection_reason: &str) {
        tracing::warn!("Prepare rejected by node {}: {}", node, rejection_reason);
    }
    fn end_prepare(&mut self) {
        tracing::debug!("Finished asking nodes to prepare the change");
    }
    fn start_commit(&mut self) {
        tracing::debug!("Committing the change");
    }
    fn committed(&mut self, node: &str) {
        tracing::debug!("Node {} has committed the change", node);
    }
    fn commit_fail(&mut self, node: &str, reason: &Error) {
        if reason.is_retryable() {
            tracing::error!(
                "Commit failed on node {}: {}. The node may hold the change prepared: run `repair` once it is reachable",
                node,
                reason
            );
        } else {
            tracing::error!("Commit failed on node {}: {}", node, reason);
        }
    }
    fn commit_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        tracing::error!(
            "Another process running on {} by {} changed the state on {}",
            last_mutation_host,
            last_mutation_user,
            node
        );
    }
    fn end_commit(&mut self) {
        tracing::debug!("Finished asking nodes to commit the change");
    }
    fn start_rollback(&mut self) {
        tracing::debug!("Rolling back the change");
    }
    fn rolled_back(&mut self, node: &str) {
        tracing::debug!("Node {} has rolled back the change", node);
    }
    fn rollback_fail(&mut self, node: &str, reason: &Error) {
        tracing::error!("Rollback failed on node {}: {}", node, reason);
    }
    fn rollback_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        tracing::error!(
            "Another process running on {} by {} changed the state on {}",
            last_mutation_host,
            last_mutation_user,
            node
        );
    }
    fn end_rollback(&mut self) {
        tracing::debug!("Finished asking nodes to roll back the change");
    }
    fn start_takeover(&mut self) {
        tracing::debug!("Start takeover");
    }
    fn takeover(&mut self, node: &str) {
        tracing::debug!("Took over node {}", node);
    }
    fn takeover_fail(&mut self, node: &str, reason: &Error) {
        tracing::warn!("Takeover failed on node {}: {}", node, reason);
    }
    fn takeover_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        tracing::warn!(
            "Takeover raced with another process on {} ({}@{})",
            node,
            last_mutation_user,
            last_mutation_host
        );
    }
    fn end_takeover(&mut self) {
        tracing::debug!("End takeover");
    }
    fn cannot_decide_over_commit_or_rollback(&mut self) {
        tracing::error!(
            "Cannot decide whether to commit or roll back: run `diagnose`, then `repair` with a forced state"
        );
    }
    fn done(&mut self, consistency: Consistency) {
        match consistency {
            Consistency::Consistent => tracing::info!("Change process completed: cluster consistent"),
            Consistency::UnknownButNoChange => tracing::info!(
                "Unable to determine consistency, but no mutative operation was performed"
            ),
            Consistency::MayNeedRecovery => tracing::error!(
                "Cluster may need recovery: run `diagnose`, then `repair`"
            ),
            Consistency::UnrecoverablyInconsistent | Consistency::UnrecoverablyPartitioned => {
                tracing::error!(
                    "Cluster is {} and cannot be trivially recovered: run `diagnose`",
                    consistency
                )
            }
        }
    }
}

/// Collects every failure, then raises them as one error
#[derive(Debug, Default)]
pub struct FailureRecorder {
    failures: Vec<String>,
    consistency: Option<Consistency>,
}

impl FailureRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn consistency(&self) -> Option<Consistency> {
        self.consistency
    }

    fn add(&mut self, failure: String) {
        self.failures.push(failure);
    }

    /// `Err` listing every recorded failure, if any
    pub fn reraise(self) -> Result<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        Err(Error::ChangeFailed {
            consistency: self.consistency.unwrap_or(Consistency::UnknownButNoChange),
            failures: self.failures,
        })
    }
}

impl<T> ResultReceiver<T> for FailureRecorder {
    fn discover_fail(&mut self, node: &str, reason: &Error) {
        self.add(format!("Discover failed on node: {}. Reason: {}", node, reason));
    }
    fn discover_already_prepared(
        &mut self,
        node: &str,
        change_uuid: Uuid,
        creation_host: &str,
        creation_user: &str,
    ) {
        self.add(format!(
            "Another change (with UUID {}) is already underway on {}. It was started by {} on {}",
            change_uuid, node, creation_user, creation_host
        ));
    }
    fn discover_cluster_inconsistent(
        &mut self,
        change_uuid: Uuid,
        committed_nodes: &[String],
        rolled_back_nodes: &[String],
    ) {
        self.add(format!(
            "UNRECOVERABLE: Inconsistent config for change: {}. Committed on: {}; rolled back on: {}",
            change_uuid,
            committed_nodes.join(", "),
            rolled_back_nodes.join(", ")
        ));
    }
    fn discover_cluster_desynchronized(&mut self, partitions: &BTreeMap<Option<Uuid>, Vec<String>>) {
        let subsets: Vec<String> = partitions
            .values()
            .map(|nodes| format!("[{}]", nodes.join(", ")))
            .collect();
        self.add(format!(
            "UNRECOVERABLE: Desynchronized configuration on cluster. Subsets: {}",
            subsets.join(", ")
        ));
    }
    fn discover_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        self.add(format!(
            "Unable to change configuration: another process running on {} by {} changed the state on {}",
            last_mutation_host, last_mutation_user, node
        ));
    }
    fn prepare_fail(&mut self, node: &str, reason: &Error) {
        self.add(format!("Prepare failed for node {}. Reason: {}", node, reason));
    }
    fn prepare_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        self.add(format!(
            "Prepare failed for node {}: another process running on {} by {} changed the state",
            node, last_mutation_host, last_mutation_user
        ));
    }
    fn prepare_change_unacceptable(&mut self, node: &str, rejection_reason: &str) {
        self.add(format!("Prepare rejected for node {}. Reason: {}", node, rejection_reason));
    }
    fn commit_fail(&mut self, node: &str, reason: &Error) {
        self.add(format!("Commit failed for node {}. Reason: {}", node, reason));
    }
    fn commit_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        self.add(format!(
            "Commit failed for node {}: another process running on {} by {} changed the state",
            node, last_mutation_host, last_mutation_user
        ));
    }
    fn rollback_fail(&mut self, node: &str, reason: &Error) {
        self.add(format!("Rollback failed for node {}. Reason: {}", node, reason));
    }
    fn rollback_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        self.add(format!(
            "Rollback failed for node {}: another process running on {} by {} changed the state",
            node, last_mutation_host, last_mutation_user
        ));
    }
    fn takeover_fail(&mut self, node: &str, reason: &Error) {
        self.add(format!("Takeover failed for node {}. Reason: {}", node, reason));
    }
    fn takeover_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        self.add(format!(
            "Takeover failed for node {}: another process running on {} by {} changed the state",
            node, last_mutation_host, last_mutation_user
        ));
    }
    fn cannot_decide_over_commit_or_rollback(&mut self) {
        self.add(
            "The repair tool was not able to decide whether the change should be committed or rolled back. \
             Force a state when running repair."
                .to_string(),
        );
    }
    fn done(&mut self, consistency: Consistency) {
        self.consistency = Some(consistency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        calls: Vec<String>,
    }

    impl ResultReceiver<u64> for Counter {
        fn prepared(&mut self, node: &str) {
            self.calls.push(format!("prepared {}", node));
        }
        fn done(&mut self, consistency: Consistency) {
            self.calls.push(format!("done {}", consistency));
        }
    }

    #[test]
    fn test_mux_forwards_in_order() {
        let mut first = Counter::default();
        let mut second = Counter::default();
        {
            let mut mux = MuxResultReceiver::new(vec![
                &mut first as &mut dyn ResultReceiver<u64>,
                &mut second,
            ]);
            mux.prepared("node-1");
            mux.committed("node-1");
            mux.done(Consistency::Consistent);
        }
        assert_eq!(first.calls, vec!["prepared node-1", "done CONSISTENT"]);
        assert_eq!(second.calls, first.calls);
    }

    #[test]
    fn test_failure_recorder() {
        let mut recorder = FailureRecorder::new();
        ResultReceiver::<u64>::prepared(&mut recorder, "node-1");
        ResultReceiver::<u64>::prepare_change_unacceptable(&mut recorder, "node-2", "no room");
        ResultReceiver::<u64>::commit_fail(&mut recorder, "node-3", &Error::Timeout("5s".into()));
        ResultReceiver::<u64>::done(&mut recorder, Consistency::MayNeedRecovery);

        assert_eq!(recorder.failures().len(), 2);
        match recorder.reraise() {
            Err(Error::ChangeFailed {
                consistency,
                failures,
            }) => {
                assert_eq!(consistency, Consistency::MayNeedRecovery);
                assert_eq!(failures[0], "Prepare rejected for node node-2. Reason: no room");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_recorder_is_ok() {
        let mut recorder = FailureRecorder::new();
        ResultReceiver::<u64>::done(&mut recorder, Consistency::Consistent);
        assert!(recorder.reraise().is_ok());
    }
}
