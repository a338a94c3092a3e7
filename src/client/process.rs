//! Orchestrator entry points: change, recovery, takeover and discovery

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::client::checker::{check_cluster, ClusterCheck};
use crate::client::decider::{
    decide_recovery, resolution_consistency, takeover_consistency, Consistency, RecoveryDecision,
};
use crate::client::endpoint::NomadEndpoint;
use crate::client::results::ResultReceiver;
use crate::client::sender::{Discovery, MessageSender};
use crate::common::{Change, ChangeState, ClientConfig, Result};
use crate::node::ConfigSnapshot;

/// Drives the two-phase commit protocol against a fixed set of nodes
pub struct NomadClient<T: ConfigSnapshot> {
    endpoints: Vec<Arc<dyn NomadEndpoint<T>>>,
    host: String,
    user: String,
    timeout: Duration,
}

impl<T: ConfigSnapshot> NomadClient<T> {
    pub fn new(
        endpoints: Vec<Arc<dyn NomadEndpoint<T>>>,
        host: impl Into<String>,
        user: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoints,
            host: host.into(),
            user: user.into(),
            timeout,
        }
    }

    /// Client over HTTP endpoints, as configured
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let endpoints = config
            .endpoints
            .iter()
            .map(|url| {
                crate::client::HttpEndpoint::new(url.clone(), config.timeout())
                    .map(|e| Arc::new(e) as Arc<dyn NomadEndpoint<T>>)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(endpoints, &config.host, &config.user, config.timeout()))
    }

    pub fn nodes(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.address().to_string()).collect()
    }

    pub fn endpoint(&self, node: &str) -> Option<Arc<dyn NomadEndpoint<T>>> {
        self.endpoints.iter().find(|e| e.address() == node).cloned()
    }

    fn sender(&self) -> MessageSender<T> {
        MessageSender::new(
            self.endpoints.clone(),
            self.host.clone(),
            self.user.clone(),
            self.timeout,
        )
    }

    /// Apply `change` on every node, or on none
    pub async fn try_apply_change(
        &self,
        receiver: &mut dyn ResultReceiver<T>,
        change: Change,
    ) -> Consistency {
        tracing::info!("Applying change on {} node(s): {}", self.endpoints.len(), change);
        let mut sender = self.sender();

        let discovery = sender.discover(receiver).await;
        if !discovery.all_reachable() {
            receiver.end_discovery();
            return finish(receiver, Consistency::UnknownButNoChange);
        }
        if let Some(verdict) = check(&discovery, receiver) {
            return finish(receiver, verdict);
        }

        let mut already_prepared = false;
        for (node, response) in &discovery.responses {
            if let Some(latest) = &response.latest_change {
                if latest.state == ChangeState::Prepared {
                    receiver.discover_already_prepared(
                        node,
                        latest.change_uuid,
                        &latest.creation_host,
                        &latest.creation_user,
                    );
                    already_prepared = true;
                }
            }
        }
        receiver.end_discovery();
        if already_prepared {
            return finish(receiver, Consistency::UnknownButNoChange);
        }

        let nodes = discovery.reachable();
        if !sender.rediscover(&nodes, receiver).await.all_succeeded() {
            return finish(receiver, Consistency::UnknownButNoChange);
        }

        let change_uuid = Uuid::new_v4();
        let version = discovery.max_highest_version() + 1;
        let prepare = sender
            .prepare(&nodes, change_uuid, version, change, receiver)
            .await;

        if prepare.tally.all_succeeded() {
            let commit = sender.commit(&prepare.accepted, change_uuid, receiver).await;
            return finish(receiver, resolution_consistency(&commit.tally, 0));
        }

        if prepare.recorded.is_empty() && prepare.tally.failed == 0 {
            return finish(receiver, Consistency::UnknownButNoChange);
        }

        // a node that failed to answer may still have recorded the prepare
        let rollback = sender
            .rollback(&prepare.recorded, change_uuid, receiver)
            .await;
        finish(
            receiver,
            resolution_consistency(&rollback.tally, prepare.tally.failed),
        )
    }

    /// Resolve a change left prepared by a client that did not finish.
    ///
    /// `forced_state` (COMMITTED or ROLLED_BACK) is used only when the
    /// reachable nodes carry no evidence of the change's fate.
    pub async fn try_recovery(
        &self,
        receiver: &mut dyn ResultReceiver<T>,
        forced_state: Option<ChangeState>,
    ) -> Consistency {
        tracing::info!("Recovering cluster of {} node(s)", self.endpoints.len());
        let mut sender = self.sender();

        let discovery = sender.discover(receiver).await;
        if discovery.responses.is_empty() {
            receiver.end_discovery();
            return finish(receiver, Consistency::UnknownButNoChange);
        }
        if let Some(verdict) = check(&discovery, receiver) {
            return finish(receiver, verdict);
        }
        receiver.end_discovery();

        let nodes = discovery.reachable();
        if !sender.rediscover(&nodes, receiver).await.all_succeeded() {
            return finish(receiver, Consistency::UnknownButNoChange);
        }

        let unreachable = discovery.failed.len();
        let decision = decide_recovery(&discovery.responses, sender.total_nodes(), forced_state);
        let (change_uuid, commit) = match decision {
            RecoveryDecision::Nothing => {
                let verdict = if unreachable == 0 {
                    Consistency::Consistent
                } else {
                    Consistency::MayNeedRecovery
                };
                return finish(receiver, verdict);
            }
            RecoveryDecision::CannotDecide => {
                receiver.cannot_decide_over_commit_or_rollback();
                return finish(receiver, Consistency::MayNeedRecovery);
            }
            RecoveryDecision::Commit(uuid) => (uuid, true),
            RecoveryDecision::Rollback(uuid) => (uuid, false),
        };

        if !sender.takeover(&nodes, receiver).await.tally.all_succeeded() {
            return finish(receiver, Consistency::UnknownButNoChange);
        }

        let prepared: Vec<String> = discovery
            .responses
            .iter()
            .filter(|(_, d)| {
                d.latest_change_uuid() == Some(change_uuid)
                    && d.latest_change_state() == Some(ChangeState::Prepared)
            })
            .map(|(node, _)| node.clone())
            .collect();

        let resolution = if commit {
            sender.commit(&prepared, change_uuid, receiver).await
        } else {
            sender.rollback(&prepared, change_uuid, receiver).await
        };
        finish(receiver, resolution_consistency(&resolution.tally, unreachable))
    }

    /// Claim every reachable node for this client
    pub async fn try_takeover(&self, receiver: &mut dyn ResultReceiver<T>) -> Consistency {
        tracing::info!("Taking over {} node(s)", self.endpoints.len());
        let mut sender = self.sender();

        let discovery = sender.discover(receiver).await;
        receiver.end_discovery();
        if discovery.responses.is_empty() {
            return finish(receiver, Consistency::UnknownButNoChange);
        }

        let takeover = sender.takeover(&discovery.reachable(), receiver).await;
        finish(
            receiver,
            takeover_consistency(&takeover.tally, discovery.failed.len()),
        )
    }

    /// Read-only pass: discovery, consistency checks and second discovery
    pub async fn try_discovery(&self, receiver: &mut dyn ResultReceiver<T>) -> Discovery<T> {
        let mut sender = self.sender();
        let discovery = sender.discover(receiver).await;
        check_cluster(&discovery.responses, receiver);
        receiver.end_discovery();
        sender.rediscover(&discovery.reachable(), receiver).await;
        discovery
    }
}

fn check<T>(discovery: &Discovery<T>, receiver: &mut dyn ResultReceiver<T>) -> Option<Consistency> {
    match check_cluster(&discovery.responses, receiver) {
        ClusterCheck::Consistent => None,
        ClusterCheck::Inconsistent { .. } => {
            receiver.end_discovery();
            Some(Consistency::UnrecoverablyInconsistent)
        }
        ClusterCheck::Desynchronized { .. } => {
            receiver.end_discovery();
            Some(Consistency::UnrecoverablyPartitioned)
        }
    }
}

fn finish<T>(receiver: &mut dyn ResultReceiver<T>, consistency: Consistency) -> Consistency {
    receiver.done(consistency);
    consistency
}
