//! HTTP API of a node
//!
//! - `GET /nomad/discover`
//! - `POST /nomad/prepare`, `/nomad/commit`, `/nomad/rollback`, `/nomad/takeover`
//! - `GET /nomad/history`, `POST /nomad/force-sync`
//! - `GET /health`
//!
//! Protocol rejections are `200` responses carrying an `AcceptRejectResponse`.
//! Errors map through [`Error::to_http_status`] with a JSON `{"error": ...}` body.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::common::{
    AcceptRejectResponse, ChangeDetails, CommitMessage, DiscoverResponse, Error, PrepareMessage,
    RollbackMessage, TakeoverMessage,
};
use crate::node::config_store::ConfigSnapshot;
use crate::node::sync::SynchronizedServer;

/// Largest accepted request body (force-sync carries a whole history)
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct NodeHttpState<T: ConfigSnapshot> {
    pub node_name: String,
    pub server: Arc<SynchronizedServer<T>>,
}

/// Error response
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn create_router<T: ConfigSnapshot>(state: NodeHttpState<T>) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health::<T>))
        .route("/nomad/discover", axum::routing::get(discover::<T>))
        .route("/nomad/prepare", axum::routing::post(prepare::<T>))
        .route("/nomad/commit", axum::routing::post(commit::<T>))
        .route("/nomad/rollback", axum::routing::post(rollback::<T>))
        .route("/nomad/takeover", axum::routing::post(takeover::<T>))
        .route("/nomad/history", axum::routing::get(history::<T>))
        .route("/nomad/force-sync", axum::routing::post(force_sync::<T>))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health<T: ConfigSnapshot>(State(state): State<NodeHttpState<T>>) -> impl IntoResponse {
    match state.server.has_incomplete_change().await {
        Ok(incomplete) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "node": state.node_name,
                "incomplete_change": incomplete,
                "version": env!("CARGO_PKG_VERSION"),
            })),
        ),
        Err(e) => (
            e.to_http_status(),
            Json(json!({
                "status": "unhealthy",
                "node": state.node_name,
                "error": e.to_string(),
            })),
        ),
    }
}

async fn discover<T: ConfigSnapshot>(
    State(state): State<NodeHttpState<T>>,
) -> ApiResult<DiscoverResponse<T>> {
    Ok(Json(state.server.discover().await?))
}

async fn prepare<T: ConfigSnapshot>(
    State(state): State<NodeHttpState<T>>,
    Json(message): Json<PrepareMessage>,
) -> ApiResult<AcceptRejectResponse> {
    tracing::info!(
        "[{}] prepare {} v{}: {}",
        state.node_name,
        message.change_uuid,
        message.version_number,
        message.change.summary()
    );
    Ok(Json(state.server.prepare(message).await?))
}

async fn commit<T: ConfigSnapshot>(
    State(state): State<NodeHttpState<T>>,
    Json(message): Json<CommitMessage>,
) -> ApiResult<AcceptRejectResponse> {
    tracing::info!("[{}] commit {}", state.node_name, message.change_uuid);
    Ok(Json(state.server.commit(message).await?))
}

async fn rollback<T: ConfigSnapshot>(
    State(state): State<NodeHttpState<T>>,
    Json(message): Json<RollbackMessage>,
) -> ApiResult<AcceptRejectResponse> {
    tracing::info!("[{}] rollback {}", state.node_name, message.change_uuid);
    Ok(Json(state.server.rollback(message).await?))
}

async fn takeover<T: ConfigSnapshot>(
    State(state): State<NodeHttpState<T>>,
    Json(message): Json<TakeoverMessage>,
) -> ApiResult<AcceptRejectResponse> {
    tracing::info!(
        "[{}] takeover by {}@{}",
        state.node_name,
        message.mutation.mutation_user,
        message.mutation.mutation_host
    );
    Ok(Json(state.server.takeover(message).await?))
}

async fn history<T: ConfigSnapshot>(
    State(state): State<NodeHttpState<T>>,
) -> ApiResult<Vec<ChangeDetails<T>>> {
    Ok(Json(state.server.change_history().await?))
}

async fn force_sync<T: ConfigSnapshot>(
    State(state): State<NodeHttpState<T>>,
    Json(history): Json<Vec<ChangeDetails<T>>>,
) -> std::result::Result<StatusCode, ApiError> {
    tracing::warn!(
        "[{}] force sync with {} change(s)",
        state.node_name,
        history.len()
    );
    state.server.force_sync(history).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Change, Mutation, NodeMode};
    use crate::node::applicator::{ChangeApplicator, PotentialApplicationResult};
    use crate::node::config_store::MemoryConfigStorage;
    use crate::node::log::MemoryChangeLog;
    use crate::node::server::NomadServer;
    use crate::node::state::ServerState;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct AllowAll;

    impl ChangeApplicator<u64> for AllowAll {
        fn try_apply(&self, existing: Option<&u64>, _change: &Change) -> PotentialApplicationResult<u64> {
            PotentialApplicationResult::allow(existing.copied().unwrap_or(0) + 1)
        }

        fn apply(&self, _change: &Change) -> crate::Result<()> {
            Ok(())
        }
    }

    fn router() -> Router {
        let state = ServerState::open(
            Box::new(MemoryChangeLog::new()),
            Box::new(MemoryConfigStorage::new()),
        )
        .unwrap();
        create_router(NodeHttpState {
            node_name: "node-1".into(),
            server: Arc::new(SynchronizedServer::new(NomadServer::new(
                state,
                Arc::new(AllowAll),
            ))),
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str, body: &impl serde::Serialize) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["node"], "node-1");
        assert_eq!(body["incomplete_change"], false);
    }

    #[tokio::test]
    async fn test_prepare_and_discover() {
        let app = router();
        let message = PrepareMessage {
            mutation: Mutation::new(1, "ops-box", "alice", Utc::now()),
            change_uuid: Uuid::new_v4(),
            version_number: 1,
            change: Change::set("a", "1"),
        };

        let response = app.clone().oneshot(post("/nomad/prepare", &message)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let accepted: AcceptRejectResponse =
            serde_json::from_value(body_json(response).await).unwrap();
        assert!(accepted.is_accepted());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/nomad/discover")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let discovery: DiscoverResponse<u64> =
            serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(discovery.mode, NodeMode::Prepared);
        assert_eq!(discovery.highest_version, 1);
    }

    #[tokio::test]
    async fn test_stale_takeover_is_a_rejection_not_an_error() {
        let message = TakeoverMessage {
            mutation: Mutation::new(42, "ops-box", "alice", Utc::now()),
        };
        let response = router()
            .oneshot(post("/nomad/takeover", &message))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["accepted"], false);
        assert_eq!(body["rejection_reason"], "DEAD");
    }
}
