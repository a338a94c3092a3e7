//! How the orchestrator reaches a node
//!
//! [`LocalEndpoint`] calls an in-process node directly. [`HttpEndpoint`]
//! talks to a node's HTTP API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{
    AcceptRejectResponse, ChangeDetails, CommitMessage, DiscoverResponse, Error, PrepareMessage,
    Result, RollbackMessage, TakeoverMessage,
};
use crate::node::{ConfigSnapshot, SynchronizedServer};

#[async_trait]
pub trait NomadEndpoint<T: ConfigSnapshot>: Send + Sync {
    /// Stable name of the node, used in every report
    fn address(&self) -> &str;

    async fn discover(&self) -> Result<DiscoverResponse<T>>;

    async fn prepare(&self, message: PrepareMessage) -> Result<AcceptRejectResponse>;

    async fn commit(&self, message: CommitMessage) -> Result<AcceptRejectResponse>;

    async fn rollback(&self, message: RollbackMessage) -> Result<AcceptRejectResponse>;

    async fn takeover(&self, message: TakeoverMessage) -> Result<AcceptRejectResponse>;

    async fn change_history(&self) -> Result<Vec<ChangeDetails<T>>>;

    async fn force_sync(&self, history: Vec<ChangeDetails<T>>) -> Result<()>;
}

/// In-process node
pub struct LocalEndpoint<T: ConfigSnapshot> {
    address: String,
    server: Arc<SynchronizedServer<T>>,
}

impl<T: ConfigSnapshot> LocalEndpoint<T> {
    pub fn new(address: impl Into<String>, server: Arc<SynchronizedServer<T>>) -> Self {
        Self {
            address: address.into(),
            server,
        }
    }
}

#[async_trait]
impl<T: ConfigSnapshot> NomadEndpoint<T> for LocalEndpoint<T> {
    fn address(&self) -> &str {
        &self.address
    }

    async fn discover(&self) -> Result<DiscoverResponse<T>> {
        self.server.discover().await
    }

    async fn prepare(&self, message: PrepareMessage) -> Result<AcceptRejectResponse> {
        self.server.prepare(message).await
    }

    async fn commit(&self, message: CommitMessage) -> Result<AcceptRejectResponse> {
        self.server.commit(message).await
    }

    async fn rollback(&self, message: RollbackMessage) -> Result<AcceptRejectResponse> {
        self.server.rollback(message).await
    }

    async fn takeover(&self, message: TakeoverMessage) -> Result<AcceptRejectResponse> {
        self.server.takeover(message).await
    }

    async fn change_history(&self) -> Result<Vec<ChangeDetails<T>>> {
        self.server.change_history().await
    }

    async fn force_sync(&self, history: Vec<ChangeDetails<T>>) -> Result<()> {
        self.server.force_sync(history).await
    }
}

/// Remote node reached over HTTP
pub struct HttpEndpoint {
    base_url: String,
    client: reqwest::Client,
}

impl HttpEndpoint {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        crate::common::utils::validate_endpoint(&base_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { base_url, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let response = self.client.get(self.url(path)).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

/// Turn an error response back into the node's error
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| status.to_string());

    Err(match status {
        StatusCode::SERVICE_UNAVAILABLE => Error::Halted(message),
        StatusCode::CONFLICT => Error::Inconsistent(message),
        StatusCode::REQUEST_TIMEOUT => Error::Timeout(message),
        _ => Error::Http(format!("{}: {}", status, message)),
    })
}

#[async_trait]
impl<T: ConfigSnapshot> NomadEndpoint<T> for HttpEndpoint {
    fn address(&self) -> &str {
        &self.base_url
    }

    async fn discover(&self) -> Result<DiscoverResponse<T>> {
        self.get("/nomad/discover").await
    }

    async fn prepare(&self, message: PrepareMessage) -> Result<AcceptRejectResponse> {
        self.post("/nomad/prepare", &message).await
    }

    async fn commit(&self, message: CommitMessage) -> Result<AcceptRejectResponse> {
        self.post("/nomad/commit", &message).await
    }

    async fn rollback(&self, message: RollbackMessage) -> Result<AcceptRejectResponse> {
        self.post("/nomad/rollback", &message).await
    }

    async fn takeover(&self, message: TakeoverMessage) -> Result<AcceptRejectResponse> {
        self.post("/nomad/takeover", &message).await
    }

    async fn change_history(&self) -> Result<Vec<ChangeDetails<T>>> {
        self.get("/nomad/history").await
    }

    async fn force_sync(&self, history: Vec<ChangeDetails<T>>) -> Result<()> {
        let response = self
            .client
            .post(self.url("/nomad/force-sync"))
            .json(&history)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}
