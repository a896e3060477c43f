//! # Gateway HTTP API
//!
//! Operator surface served on the API port.
//!
//! | Method | Path              | Description                                |
//! |--------|-------------------|--------------------------------------------|
//! | GET    | `/health`         | Liveness probe                             |
//! | GET    | `/status`         | Block parser status snapshot (JSON)        |
//! | GET    | `/status/summary` | Block parser status as one line of text    |
//! | GET    | `/notifications`  | Callback queue depths and slow hosts       |
//! | GET    | `/nodes`          | Registered peer nodes                      |
//! | POST   | `/nodes`          | Register a peer node                       |
//! | DELETE | `/nodes/:id`      | Remove a peer node (`host:port`)           |
//!
//! Domain errors map to specific status codes with a specific message.
//! Anything unexpected is logged and answered with a generic 500.

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use mapi_gateway::chain::BlockParserStatus;
use mapi_gateway::notification::NotificationScheduler;
use mapi_gateway::rpc::{Node, NodeError, NodeRepository};

// ---------------------------------------------------------------------------
// Shared State
// ---------------------------------------------------------------------------

/// Handles shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub parser: Arc<BlockParserStatus>,
    pub scheduler: Arc<NotificationScheduler>,
    pub nodes: Arc<NodeRepository>,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/status/summary", get(status_summary_handler))
        .route("/notifications", get(notifications_handler))
        .route("/nodes", get(list_nodes_handler).post(add_node_handler))
        .route("/nodes/:id", delete(remove_node_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// Body of `POST /nodes`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddNodeRequest {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub zmq_endpoint: Option<String>,
    #[serde(default)]
    pub remarks: Option<String>,
}

/// A registered node as reported by the API. Credentials are never echoed.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub zmq_endpoint: Option<String>,
    pub remarks: Option<String>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl From<Node> for NodeView {
    fn from(node: Node) -> Self {
        Self {
            id: node.id(),
            host: node.host,
            port: node.port,
            username: node.username,
            zmq_endpoint: node.zmq_endpoint,
            remarks: node.remarks,
            last_error: node.last_error,
            last_error_at: node.last_error_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationQueueResponse {
    pub fast_queued: usize,
    pub slow_queued: usize,
    pub slow_hosts: Vec<String>,
}

/// Generic error body returned on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Handler error: wraps the registry error so it can map to a response.
#[derive(Debug)]
pub struct ApiError(NodeError);

impl From<NodeError> for ApiError {
    fn from(e: NodeError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            e @ NodeError::NotFound(_) => error_response(StatusCode::NOT_FOUND, e.to_string()),
            e @ NodeError::AlreadyExists(_) => error_response(StatusCode::CONFLICT, e.to_string()),
            e @ NodeError::Invalid(_) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
            NodeError::Storage(detail) => {
                error!(error = %detail, "node registry failure");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: 200 while the process is up. Subsystem state is in `/status`.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "version": state.version })),
    )
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.parser.snapshot())
}

async fn status_summary_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.parser.snapshot().summary()
}

async fn notifications_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut slow_hosts = state.scheduler.latency().get_hosts(true);
    slow_hosts.sort();
    Json(NotificationQueueResponse {
        fast_queued: state.scheduler.fast_len(),
        slow_queued: state.scheduler.slow_len(),
        slow_hosts,
    })
}

async fn list_nodes_handler(State(state): State<AppState>) -> impl IntoResponse {
    let nodes: Vec<NodeView> = state.nodes.list().into_iter().map(NodeView::from).collect();
    Json(nodes)
}

async fn add_node_handler(
    State(state): State<AppState>,
    Json(req): Json<AddNodeRequest>,
) -> Result<(StatusCode, Json<NodeView>), ApiError> {
    let mut node = Node::new(req.host, req.port);
    node.username = req.username;
    node.password = req.password;
    node.zmq_endpoint = req.zmq_endpoint;
    node.remarks = req.remarks;

    let node = state.nodes.add(node)?;
    info!(node = %node.id(), "peer node registered");
    Ok((StatusCode::CREATED, Json(NodeView::from(node))))
}

async fn remove_node_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<NodeView>, ApiError> {
    let node = state.nodes.remove(&id)?;
    info!(node = %id, "peer node removed");
    Ok(Json(NodeView::from(node)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use mapi_gateway::config::NotificationConfig;
    use mapi_gateway::crypto::Hash256;
    use mapi_gateway::notification::HostLatencyTracker;
    use mapi_gateway::storage::GatewayDb;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        state: AppState,
        _db: GatewayDb,
    }

    fn test_app() -> TestApp {
        let db = GatewayDb::open_temporary().expect("temp db");
        let nodes = NodeRepository::open(db.open_tree("nodes").expect("tree")).expect("repo");
        let config = NotificationConfig::default();
        let latency = Arc::new(HostLatencyTracker::new(
            config.saved_execution_times,
            config.slow_host_threshold_ms,
        ));
        let state = AppState {
            version: "0.1.0-test".into(),
            parser: Arc::new(BlockParserStatus::new()),
            scheduler: Arc::new(NotificationScheduler::new(&config, latency)),
            nodes: Arc::new(nodes),
        };
        TestApp {
            router: create_router(state.clone()),
            state,
            _db: db,
        }
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, body)
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        send(router, Request::builder().uri(path).body(Body::empty()).unwrap()).await
    }

    async fn post_json(router: &Router, path: &str, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        send(router, req).await
    }

    async fn delete(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("DELETE")
            .uri(path)
            .body(Body::empty())
            .unwrap();
        send(router, req).await
    }

    fn json(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = test_app();
        let (status, body) = get(&app.router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], "0.1.0-test");
    }

    #[tokio::test]
    async fn status_reports_parser_snapshot() {
        let app = test_app();
        app.state.parser.block_processed();
        app.state.parser.set_best_block(Hash256([1; 32]), 700_000);

        let (status, body) = get(&app.router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["blocksProcessed"], 1);
        assert_eq!(body["bestBlockHeight"], 700_000);
        assert_eq!(body["bestBlockHash"], Hash256([1; 32]).to_hex());
    }

    #[tokio::test]
    async fn status_summary_is_plain_text() {
        let app = test_app();
        let (status, body) = get(&app.router, "/status/summary").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("Block parser:"));
        assert!(text.contains("Best block: none"));
    }

    #[tokio::test]
    async fn notifications_endpoint_reports_empty_queues() {
        let app = test_app();
        let (status, body) = get(&app.router, "/notifications").await;
        assert_eq!(status, StatusCode::OK);
        let resp: NotificationQueueResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.fast_queued, 0);
        assert_eq!(resp.slow_queued, 0);
        assert!(resp.slow_hosts.is_empty());
    }

    #[tokio::test]
    async fn nodes_can_be_added_listed_and_removed() {
        let app = test_app();
        let (status, body) = post_json(
            &app.router,
            "/nodes",
            serde_json::json!({ "host": "10.0.0.5", "port": 8332, "username": "rpc", "password": "secret" }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let created = json(&body);
        assert_eq!(created["id"], "10.0.0.5:8332");
        assert!(created.get("password").is_none());

        let (status, body) = get(&app.router, "/nodes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body).as_array().unwrap().len(), 1);

        let (status, _) = delete(&app.router, "/nodes/10.0.0.5:8332").await;
        assert_eq!(status, StatusCode::OK);
        assert!(app.state.nodes.is_empty());
    }

    #[tokio::test]
    async fn removing_unknown_node_is_404_with_specific_message() {
        let app = test_app();
        let (status, body) = delete(&app.router, "/nodes/nowhere:1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error, "no such node");
    }

    #[tokio::test]
    async fn duplicate_and_invalid_nodes_are_rejected() {
        let app = test_app();
        let node = serde_json::json!({ "host": "peer", "port": 8332 });
        let (status, _) = post_json(&app.router, "/nodes", node.clone()).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = post_json(&app.router, "/nodes", node).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) =
            post_json(&app.router, "/nodes", serde_json::json!({ "host": " ", "port": 1 })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json(&body)["error"].as_str().unwrap().contains("host"));
    }

    #[test]
    fn storage_errors_are_generic_500() {
        let resp = ApiError::from(NodeError::Storage("disk on fire".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
