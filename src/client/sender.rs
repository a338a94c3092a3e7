//! Parallel fan-out of protocol messages
//!
//! Every phase calls all its target nodes concurrently, waits for every
//! answer (or the per-call timeout), then reports the outcomes to the result
//! receiver in endpoint order. The sender tracks each node's mutative message
//! count so every message carries the count the node expects.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::client::decider::Tally;
use crate::client::endpoint::NomadEndpoint;
use crate::client::results::ResultReceiver;
use crate::common::{
    AcceptRejectResponse, Change, CommitMessage, DiscoverResponse, Error, Mutation,
    PrepareMessage, RejectionReason, Result, RollbackMessage, TakeoverMessage,
};
use crate::node::ConfigSnapshot;

/// Result of one discovery round
#[derive(Debug, Clone)]
pub struct Discovery<T> {
    /// Answers, in endpoint order
    pub responses: Vec<(String, DiscoverResponse<T>)>,
    /// Nodes that failed or timed out
    pub failed: Vec<String>,
}

impl<T> Discovery<T> {
    pub fn reachable(&self) -> Vec<String> {
        self.responses.iter().map(|(node, _)| node.clone()).collect()
    }

    pub fn all_reachable(&self) -> bool {
        self.failed.is_empty()
    }

    /// Highest version any node has seen, committed or not
    pub fn max_highest_version(&self) -> u64 {
        self.responses
            .iter()
            .map(|(_, d)| d.highest_version)
            .max()
            .unwrap_or(0)
    }
}

/// Outcome of one mutative broadcast
#[derive(Debug, Clone, Default)]
pub struct Broadcast {
    pub tally: Tally,
    /// Nodes that accepted the message
    pub accepted: Vec<String>,
    /// Nodes whose log now holds the message's effect: accepted, plus
    /// UNACCEPTABLE prepares
    pub recorded: Vec<String>,
}

#[derive(Debug, Clone)]
enum Message {
    Prepare {
        change_uuid: Uuid,
        version_number: u64,
        change: Change,
    },
    Commit(Uuid),
    Rollback(Uuid),
    Takeover,
}

pub struct MessageSender<T: ConfigSnapshot> {
    endpoints: Vec<Arc<dyn NomadEndpoint<T>>>,
    host: String,
    user: String,
    timeout: Duration,
    counts: HashMap<String, u64>,
}

impl<T: ConfigSnapshot> MessageSender<T> {
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
            counts: HashMap::new(),
        }
    }

    pub fn nodes(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.address().to_string()).collect()
    }

    pub fn total_nodes(&self) -> usize {
        self.endpoints.len()
    }

    /// Mutative message count last seen on `node`
    pub fn count(&self, node: &str) -> Option<u64> {
        self.counts.get(node).copied()
    }

    fn targets(&self, nodes: &[String]) -> Vec<Arc<dyn NomadEndpoint<T>>> {
        self.endpoints
            .iter()
            .filter(|e| nodes.iter().any(|n| n == e.address()))
            .cloned()
            .collect()
    }

    /// Discover every node, recording their counts
    pub async fn discover(&mut self, receiver: &mut dyn ResultReceiver<T>) -> Discovery<T> {
        receiver.start_discovery(&self.nodes());
        let results = self.discover_round(&self.endpoints.clone()).await;

        let mut discovery = Discovery {
            responses: Vec::new(),
            failed: Vec::new(),
        };
        for (node, result) in results {
            match result {
                Ok(response) => {
                    receiver.discovered(&node, &response);
                    self.counts.insert(node.clone(), response.mutative_message_count);
                    discovery.responses.push((node, response));
                }
                Err(e) => {
                    receiver.discover_fail(&node, &e);
                    self.counts.remove(&node);
                    discovery.failed.push(node);
                }
            }
        }
        discovery
    }

    /// Discover `nodes` again; a count that moved means another client is
    /// at work. Returns the nodes that failed or changed.
    pub async fn rediscover(
        &mut self,
        nodes: &[String],
        receiver: &mut dyn ResultReceiver<T>,
    ) -> Tally {
        receiver.start_second_discovery();
        let results = self.discover_round(&self.targets(nodes)).await;

        let mut tally = Tally::default();
        for (node, result) in results {
            match result {
                Ok(response) if self.count(&node) == Some(response.mutative_message_count) => {
                    receiver.discover_repeated(&node);
                    tally.succeeded += 1;
                }
                Ok(response) => {
                    receiver.discover_other_client(
                        &node,
                        response.last_mutation_host.as_deref().unwrap_or(""),
                        response.last_mutation_user.as_deref().unwrap_or(""),
                    );
                    self.counts.insert(node, response.mutative_message_count);
                    tally.other_client += 1;
                }
                Err(e) => {
                    receiver.discover_fail(&node, &e);
                    tally.failed += 1;
                }
            }
        }
        receiver.end_second_discovery();
        tally
    }

    async fn discover_round(
        &self,
        targets: &[Arc<dyn NomadEndpoint<T>>],
    ) -> Vec<(String, Result<DiscoverResponse<T>>)> {
        let timeout = self.timeout;
        let calls = targets.iter().map(|endpoint| {
            let endpoint = Arc::clone(endpoint);
            async move {
                let address = endpoint.address().to_string();
                let result = with_timeout(timeout, &address, endpoint.discover()).await;
                (address, result)
            }
        });
        join_all(calls).await
    }

    pub async fn prepare(
        &mut self,
        nodes: &[String],
        change_uuid: Uuid,
        version_number: u64,
        change: Change,
        receiver: &mut dyn ResultReceiver<T>,
    ) -> Broadcast {
        receiver.start_prepare(change_uuid);
        let message = Message::Prepare {
            change_uuid,
            version_number,
            change,
        };
        let broadcast = self.broadcast(nodes, message, receiver).await;
        receiver.end_prepare();
        broadcast
    }

    pub async fn commit(
        &mut self,
        nodes: &[String],
        change_uuid: Uuid,
        receiver: &mut dyn ResultReceiver<T>,
    ) -> Broadcast {
        receiver.start_commit();
        let broadcast = self
            .broadcast(nodes, Message::Commit(change_uuid), receiver)
            .await;
        receiver.end_commit();
        broadcast
    }

    pub async fn rollback(
        &mut self,
        nodes: &[String],
        change_uuid: Uuid,
        receiver: &mut dyn ResultReceiver<T>,
    ) -> Broadcast {
        receiver.start_rollback();
        let broadcast = self
            .broadcast(nodes, Message::Rollback(change_uuid), receiver)
            .await;
        receiver.end_rollback();
        broadcast
    }

    pub async fn takeover(
        &mut self,
        nodes: &[String],
        receiver: &mut dyn ResultReceiver<T>,
    ) -> Broadcast {
        receiver.start_takeover();
        let broadcast = self.broadcast(nodes, Message::Takeover, receiver).await;
        receiver.end_takeover();
        broadcast
    }

    async fn broadcast(
        &mut self,
        nodes: &[String],
        message: Message,
        receiver: &mut dyn ResultReceiver<T>,
    ) -> Broadcast {
        let timeout = self.timeout;
        let now = crate::common::timestamp_now();
        let calls = self.targets(nodes).into_iter().map(|endpoint| {
            let address = endpoint.address().to_string();
            let mutation = self
                .count(&address)
                .map(|count| Mutation::new(count, self.host.clone(), self.user.clone(), now));
            let message = message.clone();
            async move {
                let result = match mutation {
                    Some(mutation) => {
                        with_timeout(timeout, &address, send(endpoint.as_ref(), mutation, message))
                            .await
                    }
                    None => Err(Error::Other(format!("node {} was not discovered", address))),
                };
                (address, result)
            }
        });
        let results = join_all(calls).await;

        let mut broadcast = Broadcast::default();
        for (node, result) in results {
            match result {
                Ok(response) if response.is_accepted() => {
                    self.bump(&node);
                    report_success(receiver, &message, &node);
                    broadcast.tally.succeeded += 1;
                    broadcast.accepted.push(node.clone());
                    broadcast.recorded.push(node);
                }
                Ok(response) => match response.rejection_reason {
                    Some(RejectionReason::Unacceptable) => {
                        self.bump(&node);
                        receiver.prepare_change_unacceptable(&node, response.rejection_message());
                        broadcast.tally.unacceptable += 1;
                        broadcast.recorded.push(node);
                    }
                    Some(RejectionReason::Dead) => {
                        report_other_client(receiver, &message, &node, &response);
                        broadcast.tally.other_client += 1;
                    }
                    _ => {
                        let reason = Error::Other(format!(
                            "BAD: {}",
                            response.rejection_message()
                        ));
                        report_failure(receiver, &message, &node, &reason);
                        broadcast.tally.failed += 1;
                    }
                },
                Err(e) => {
                    report_failure(receiver, &message, &node, &e);
                    broadcast.tally.failed += 1;
                }
            }
        }
        broadcast
    }

    fn bump(&mut self, node: &str) {
        if let Some(count) = self.counts.get_mut(node) {
            *count += 1;
        }
    }
}

async fn send<T: ConfigSnapshot>(
    endpoint: &dyn NomadEndpoint<T>,
    mutation: Mutation,
    message: Message,
) -> Result<AcceptRejectResponse> {
    match message {
        Message::Prepare {
            change_uuid,
            version_number,
            change,
        } => {
            endpoint
                .prepare(PrepareMessage {
                    mutation,
                    change_uuid,
                    version_number,
                    change,
                })
                .await
        }
        Message::Commit(change_uuid) => {
            endpoint
                .commit(CommitMessage {
                    mutation,
                    change_uuid,
                })
                .await
        }
        Message::Rollback(change_uuid) => {
            endpoint
                .rollback(RollbackMessage {
                    mutation,
                    change_uuid,
                })
                .await
        }
        Message::Takeover => endpoint.takeover(TakeoverMessage { mutation }).await,
    }
}

async fn with_timeout<R>(
    timeout: Duration,
    address: &str,
    call: impl Future<Output = Result<R>>,
) -> Result<R> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_elapsed) => Err(Error::Timeout(format!(
            "{} did not answer within {}ms",
            address,
            timeout.as_millis()
        ))),
    }
}

fn report_success<T>(receiver: &mut dyn ResultReceiver<T>, message: &Message, node: &str) {
    match message {
        Message::Prepare { .. } => receiver.prepared(node),
        Message::Commit(_) => receiver.committed(node),
        Message::Rollback(_) => receiver.rolled_back(node),
        Message::Takeover => receiver.takeover(node),
    }
}

fn report_failure<T>(
    receiver: &mut dyn ResultReceiver<T>,
    message: &Message,
    node: &str,
    reason: &Error,
) {
    match message {
        Message::Prepare { .. } => receiver.prepare_fail(node, reason),
        Message::Commit(_) => receiver.commit_fail(node, reason),
        Message::Rollback(_) => receiver.rollback_fail(node, reason),
        Message::Takeover => receiver.takeover_fail(node, reason),
    }
}

fn report_other_client<T>(
    receiver: &mut dyn ResultReceiver<T>,
    message: &Message,
    node: &str,
    response: &AcceptRejectResponse,
) {
    let host = response.last_mutation_host.as_deref().unwrap_or("");
    let user = response.last_mutation_user.as_deref().unwrap_or("");
    match message {
        Message::Prepare { .. } => receiver.prepare_other_client(node, host, user),
        Message::Commit(_) => receiver.commit_other_client(node, host, user),
        Message::Rollback(_) => receiver.rollback_other_client(node, host, user),
        Message::Takeover => receiver.takeover_other_client(node, host, user),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::endpoint::LocalEndpoint;
    use crate::client::results::LoggingResultReceiver;
    use crate::cluster::{ClusterConfig, ClusterConfigApplicator};
    use crate::node::{MemoryChangeLog, MemoryConfigStorage, NomadServer, ServerState, SynchronizedServer};

    fn node(name: &str) -> Arc<dyn NomadEndpoint<ClusterConfig>> {
        let state = ServerState::open(
            Box::new(MemoryChangeLog::new()),
            Box::new(MemoryConfigStorage::new()),
        )
        .unwrap();
        let server = NomadServer::new(state, Arc::new(ClusterConfigApplicator::new(name)));
        Arc::new(LocalEndpoint::new(name, Arc::new(SynchronizedServer::new(server))))
    }

    fn sender(names: &[&str]) -> MessageSender<ClusterConfig> {
        MessageSender::new(
            names.iter().map(|n| node(n)).collect(),
            "ops-box",
            "alice",
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_counts_follow_accepted_messages() {
        let mut sender = sender(&["a", "b"]);
        let mut receiver = LoggingResultReceiver;

        let discovery = sender.discover(&mut receiver).await;
        assert!(discovery.all_reachable());
        assert_eq!(sender.count("a"), Some(1));

        let nodes = discovery.reachable();
        let uuid = Uuid::new_v4();
        let change = Change::activation("prod", vec!["a".into(), "b".into()]);
        let prepared = sender.prepare(&nodes, uuid, 1, change, &mut receiver).await;
        assert!(prepared.tally.all_succeeded());
        assert_eq!(sender.count("b"), Some(2));

        let committed = sender.commit(&prepared.accepted, uuid, &mut receiver).await;
        assert_eq!(committed.tally.succeeded, 2);
        assert_eq!(sender.count("a"), Some(3));

        // nothing moved since the last message
        let second = sender.rediscover(&nodes, &mut receiver).await;
        assert!(second.all_succeeded());
    }

    #[tokio::test]
    async fn test_stale_sender_is_dead() {
        let shared = node("a");
        let mut first = MessageSender::new(vec![Arc::clone(&shared)], "ops-box", "alice", Duration::from_secs(1));
        let mut second = MessageSender::new(vec![shared], "other-box", "bob", Duration::from_secs(1));
        let mut receiver = LoggingResultReceiver;

        first.discover(&mut receiver).await;
        second.discover(&mut receiver).await;

        let nodes = vec!["a".to_string()];
        assert_eq!(second.takeover(&nodes, &mut receiver).await.tally.succeeded, 1);

        let outcome = first.takeover(&nodes, &mut receiver).await;
        assert_eq!(outcome.tally.other_client, 1);
        assert!(outcome.accepted.is_empty());

        let again = first.rediscover(&nodes, &mut receiver).await;
        assert_eq!(again.other_client, 1);
    }

    #[tokio::test]
    async fn test_undiscovered_node_fails() {
        let mut sender = sender(&["a"]);
        let mut receiver = LoggingResultReceiver;
        let outcome = sender
            .takeover(&["a".to_string()], &mut receiver)
            .await;
        assert_eq!(outcome.tally.failed, 1);
    }
}
