//! Multi-node change scenarios over in-process nodes

use async_trait::async_trait;
use minicfg::client::{
    Consistency, LocalEndpoint, LoggingResultReceiver, MessageSender, NomadClient, NomadEndpoint,
};
use minicfg::cluster::{ClusterConfig, ClusterConfigApplicator};
use minicfg::common::{
    AcceptRejectResponse, Change, ChangeDetails, ChangeState, CommitMessage, DiscoverResponse,
    Error, NodeMode, PrepareMessage, Result, RollbackMessage, TakeoverMessage,
};
use minicfg::node::{MemoryChangeLog, MemoryConfigStorage, NomadServer, ServerState, SynchronizedServer};
use minicfg::ops::{apply_change, diagnose_cluster, repair_cluster, sync_node};
use minicfg::client::GlobalState;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

type Server = Arc<SynchronizedServer<ClusterConfig>>;

fn start_node(name: &str) -> Server {
    let state = ServerState::open(
        Box::new(MemoryChangeLog::new()),
        Box::new(MemoryConfigStorage::new()),
    )
    .unwrap();
    Arc::new(SynchronizedServer::new(NomadServer::new(
        state,
        Arc::new(ClusterConfigApplicator::new(name)),
    )))
}

fn local(name: &str, server: &Server) -> Arc<dyn NomadEndpoint<ClusterConfig>> {
    Arc::new(LocalEndpoint::new(name, Arc::clone(server)))
}

fn client(endpoints: Vec<Arc<dyn NomadEndpoint<ClusterConfig>>>) -> NomadClient<ClusterConfig> {
    NomadClient::new(endpoints, "ops-box", "alice", Duration::from_secs(2))
}

/// Drops every commit before it reaches the node
struct LosesCommits {
    inner: Arc<dyn NomadEndpoint<ClusterConfig>>,
}

#[async_trait]
impl NomadEndpoint<ClusterConfig> for LosesCommits {
    fn address(&self) -> &str {
        self.inner.address()
    }

    async fn discover(&self) -> Result<DiscoverResponse<ClusterConfig>> {
        self.inner.discover().await
    }

    async fn prepare(&self, message: PrepareMessage) -> Result<AcceptRejectResponse> {
        self.inner.prepare(message).await
    }

    async fn commit(&self, _message: CommitMessage) -> Result<AcceptRejectResponse> {
        Err(Error::ConnectionFailed("connection reset by peer".into()))
    }

    async fn rollback(&self, message: RollbackMessage) -> Result<AcceptRejectResponse> {
        self.inner.rollback(message).await
    }

    async fn takeover(&self, message: TakeoverMessage) -> Result<AcceptRejectResponse> {
        self.inner.takeover(message).await
    }

    async fn change_history(&self) -> Result<Vec<ChangeDetails<ClusterConfig>>> {
        self.inner.change_history().await
    }

    async fn force_sync(&self, history: Vec<ChangeDetails<ClusterConfig>>) -> Result<()> {
        self.inner.force_sync(history).await
    }
}

fn names(nodes: &[&str]) -> Vec<String> {
    nodes.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn test_single_node_prepare_then_commit() {
    let server = start_node("node-1");
    let client = client(vec![local("node-1", &server)]);

    let fresh = server.discover().await.unwrap();
    assert_eq!(fresh.mode, NodeMode::Accepting);
    assert_eq!(fresh.current_version, 0);
    assert!(fresh.latest_change.is_none());

    let report = apply_change(&client, Change::activation("prod", names(&["node-1"])))
        .await
        .unwrap();
    assert_eq!(report.consistency, Consistency::Consistent);

    let after = server.discover().await.unwrap();
    assert_eq!(after.mode, NodeMode::Accepting);
    assert_eq!(after.current_version, 1);
    // init, prepare, commit
    assert_eq!(after.mutative_message_count, 3);
    assert_eq!(after.latest_change_state(), Some(ChangeState::Committed));
}

#[tokio::test]
async fn test_one_node_refuses_prepare() {
    let a = start_node("a");
    let b = start_node("b");
    let client = client(vec![local("a", &a), local("b", &b)]);

    // b is not part of the activated nodes and refuses
    let err = apply_change(&client, Change::activation("prod", names(&["a"])))
        .await
        .unwrap_err();
    match err {
        Error::ChangeFailed {
            consistency,
            failures,
        } => {
            assert_eq!(consistency, Consistency::Consistent);
            assert_eq!(failures.len(), 1);
            assert!(failures[0].starts_with("Prepare rejected for node b"));
        }
        other => panic!("unexpected {:?}", other),
    }

    for server in [&a, &b] {
        let discovery = server.discover().await.unwrap();
        assert_eq!(discovery.current_version, 0);
        assert_eq!(discovery.mode, NodeMode::Accepting);
        assert_eq!(discovery.latest_change_state(), Some(ChangeState::RolledBack));
    }
}

#[tokio::test]
async fn test_lost_commit_needs_recovery_then_repair() {
    let servers: Vec<Server> = ["a", "b", "c"].iter().map(|n| start_node(n)).collect();
    let flaky = client(vec![
        local("a", &servers[0]),
        local("b", &servers[1]),
        Arc::new(LosesCommits {
            inner: local("c", &servers[2]),
        }),
    ]);

    let report = apply_change(&flaky, Change::activation("prod", names(&["a", "b", "c"])))
        .await
        .unwrap();
    assert_eq!(report.consistency, Consistency::MayNeedRecovery);
    assert_eq!(report.committed_nodes, names(&["a", "b"]));
    assert!(report.failures[0].starts_with("Commit failed for node c"));

    let healthy = client(vec![
        local("a", &servers[0]),
        local("b", &servers[1]),
        local("c", &servers[2]),
    ]);
    let diagnosis = diagnose_cluster(&healthy).await.unwrap();
    assert_eq!(diagnosis.global_state, GlobalState::PartiallyCommitted);

    // a new change is refused until the cluster is repaired
    let refused = apply_change(&healthy, Change::set("offheap", "1GB")).await;
    assert!(refused.is_err());

    let repaired = repair_cluster(&healthy, None).await.unwrap();
    assert_eq!(repaired.consistency, Consistency::Consistent);
    for server in &servers {
        let discovery = server.discover().await.unwrap();
        assert_eq!(discovery.current_version, 1);
        assert_eq!(discovery.latest_change_state(), Some(ChangeState::Committed));
    }

    let report = apply_change(&healthy, Change::set("offheap", "1GB")).await.unwrap();
    assert_eq!(report.consistency, Consistency::Consistent);
}

#[tokio::test]
async fn test_lost_commit_fixed_by_sync() {
    let servers: Vec<Server> = ["a", "b", "c"].iter().map(|n| start_node(n)).collect();
    let flaky = client(vec![
        local("a", &servers[0]),
        local("b", &servers[1]),
        Arc::new(LosesCommits {
            inner: local("c", &servers[2]),
        }),
    ]);
    apply_change(&flaky, Change::activation("prod", names(&["a", "b", "c"])))
        .await
        .unwrap();

    let report = sync_node(&flaky, "a", "c").await.unwrap();
    assert_eq!(report.changes_replayed, 1);
    assert_eq!(report.current_version, 1);

    let source = servers[0].change_history().await.unwrap();
    let target = servers[2].change_history().await.unwrap();
    assert_eq!(source, target);
}

#[tokio::test]
async fn test_abandoned_prepare_needs_forced_state() {
    let servers: Vec<Server> = ["a", "b"].iter().map(|n| start_node(n)).collect();
    let endpoints = vec![local("a", &servers[0]), local("b", &servers[1])];

    // a client that prepared everywhere, then vanished
    let mut crashed = MessageSender::new(endpoints.clone(), "crashed-box", "bob", Duration::from_secs(1));
    let mut receiver = LoggingResultReceiver;
    let discovery = crashed.discover(&mut receiver).await;
    let prepared = crashed
        .prepare(
            &discovery.reachable(),
            Uuid::new_v4(),
            1,
            Change::activation("prod", names(&["a", "b"])),
            &mut receiver,
        )
        .await;
    assert_eq!(prepared.accepted.len(), 2);

    let client = client(endpoints);
    assert_eq!(
        diagnose_cluster(&client).await.unwrap().global_state,
        GlobalState::Prepared
    );

    match repair_cluster(&client, None).await.unwrap_err() {
        Error::ChangeFailed { consistency, .. } => {
            assert_eq!(consistency, Consistency::MayNeedRecovery)
        }
        other => panic!("unexpected {:?}", other),
    }

    let repaired = repair_cluster(&client, Some(ChangeState::Committed)).await.unwrap();
    assert_eq!(repaired.consistency, Consistency::Consistent);
    for server in &servers {
        let discovery = server.discover().await.unwrap();
        assert_eq!(discovery.current_version, 1);
        assert_eq!(discovery.last_mutation_user.as_deref(), Some("alice"));
    }
}
