//! End-to-end over the node HTTP API

use minicfg::client::{Consistency, GlobalState, HttpEndpoint, NomadClient, NomadEndpoint};
use minicfg::cluster::{ClusterConfig, ClusterConfigApplicator};
use minicfg::common::{Change, Error, LogBackend, NodeConfig};
use minicfg::node::{create_router, open_server, NodeHttpState};
use minicfg::ops::{apply_change, diagnose_cluster, takeover_cluster};
use std::sync::Arc;
use std::time::Duration;

async fn spawn_node(name: &str) -> String {
    let config = NodeConfig {
        node_name: name.to_string(),
        log_backend: LogBackend::Memory,
        ..NodeConfig::default()
    };
    let server = open_server::<ClusterConfig>(&config, Arc::new(ClusterConfigApplicator::new(name)))
        .unwrap();
    let router = create_router(NodeHttpState {
        node_name: name.to_string(),
        server,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn http_client(urls: &[String]) -> NomadClient<ClusterConfig> {
    let endpoints = urls
        .iter()
        .map(|url| {
            Arc::new(HttpEndpoint::new(url.clone(), Duration::from_secs(2)).unwrap())
                as Arc<dyn NomadEndpoint<ClusterConfig>>
        })
        .collect();
    NomadClient::new(endpoints, "ops-box", "alice", Duration::from_secs(2))
}

#[tokio::test]
async fn test_change_over_http() {
    let urls = vec![spawn_node("node-1").await, spawn_node("node-2").await];
    let client = http_client(&urls);

    let nodes = vec!["node-1".to_string(), "node-2".to_string()];
    let report = apply_change(&client, Change::activation("prod", nodes)).await.unwrap();
    assert_eq!(report.consistency, Consistency::Consistent);

    let report = apply_change(&client, Change::set("offheap.main", "512MB")).await.unwrap();
    assert_eq!(report.committed_nodes, urls);

    for url in &urls {
        let endpoint = HttpEndpoint::new(url.clone(), Duration::from_secs(2)).unwrap();
        let discovery = NomadEndpoint::<ClusterConfig>::discover(&endpoint).await.unwrap();
        assert_eq!(discovery.current_version, 2);
        let config = discovery.latest_committed_change.unwrap().change_result.unwrap();
        assert_eq!(config.setting("offheap.main"), Some("512MB"));
    }

    let diagnosis = diagnose_cluster(&client).await.unwrap();
    assert_eq!(diagnosis.global_state, GlobalState::Accepting);
}

#[tokio::test]
async fn test_unreachable_node_blocks_change() {
    let up = spawn_node("node-1").await;
    // nothing listens on port 1
    let client = http_client(&[up, "http://127.0.0.1:1".to_string()]);

    let nodes = vec!["node-1".to_string(), "node-2".to_string()];
    match apply_change(&client, Change::activation("prod", nodes)).await {
        Err(Error::ChangeFailed { consistency, failures }) => {
            assert_eq!(consistency, Consistency::UnknownButNoChange);
            assert!(failures[0].starts_with("Discover failed on node: http://127.0.0.1:1"));
        }
        other => panic!("unexpected {:?}", other),
    }

    let diagnosis = diagnose_cluster(&client).await.unwrap();
    assert_eq!(diagnosis.global_state, GlobalState::Accepting);
    assert!(!diagnosis.nodes[1].reachable);

    // takeover reaches only part of the cluster
    assert!(takeover_cluster(&client).await.is_err());
}
