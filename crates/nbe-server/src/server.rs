//! `DispatchServer`: Axum HTTP + agent WebSocket front.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use nbe_core::Task;
use nbe_dispatch::transport::websocket::{WsOptions, WsTransport};
use nbe_dispatch::{DispatchError, Hub};
use nbe_store::OrchestrationStore;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics::{TASKS_REJECTED_TOTAL, WS_CONNECTIONS_TOTAL};
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session registry.
    pub hub: Arc<Hub>,
    /// Host records are created here on connect.
    pub store: Arc<dyn OrchestrationStore>,
    /// Renders `/metrics`.
    pub metrics: PrometheusHandle,
    /// Deadlines for accepted agent sockets.
    pub ws: WsOptions,
    /// Largest accepted agent frame.
    pub max_message_size: usize,
    /// When the server started.
    pub start_time: Instant,
}

/// The master's network front.
pub struct DispatchServer {
    config: ServerConfig,
    hub: Arc<Hub>,
    store: Arc<dyn OrchestrationStore>,
    metrics: PrometheusHandle,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl DispatchServer {
    /// Create a server over an existing hub and store.
    pub fn new(
        config: ServerConfig,
        hub: Arc<Hub>,
        store: Arc<dyn OrchestrationStore>,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            config,
            hub,
            store,
            metrics,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            ws: self.config.ws,
            max_message_size: self.config.max_message_size,
            start_time: self.start_time,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/hosts/{host}/tasks", post(submit_task))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind and serve until the shutdown token fires.
    ///
    /// The serving task is tracked by the shutdown coordinator. Returns the
    /// bound address.
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let token = self.shutdown.token();

        self.shutdown.track(tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                warn!(error = %e, "server stopped with error");
            }
        }));
        info!(%addr, "nbe master listening");
        Ok(addr)
    }

    /// The hub behind this server.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /ws: agent upgrade. The peer IP identifies the host.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let host = peer.ip().to_string();
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| accept_agent(socket, host, state))
}

async fn accept_agent(socket: WebSocket, host: String, state: AppState) {
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    if let Err(e) = state.store.ensure_host(&host, "") {
        warn!(host = %host, error = %e, "failed to record host");
    }
    let transport = Arc::new(WsTransport::new(socket, state.ws));
    let session = state.hub.connect(host, transport);
    info!(host = session.host(), session_id = %session.id(), "agent connected");
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.hub.session_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    crate::metrics::render(&state.metrics)
}

/// POST /hosts/{host}/tasks
async fn submit_task(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Json(task): Json<Task>,
) -> Result<StatusCode, ApiError> {
    state.hub.dispatch(&host, task).await?;
    Ok(StatusCode::ACCEPTED)
}

/// A routing failure rendered as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason) = match self.0 {
            DispatchError::SessionNotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            DispatchError::SessionClosed { .. } => (StatusCode::CONFLICT, "closed"),
        };
        counter!(TASKS_REJECTED_TOTAL, "reason" => reason).increment(1);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use nbe_core::Placement;
    use nbe_dispatch::transport::memory::{self, MemoryAgent};
    use nbe_dispatch::{FlushPolicy, HubConfig, ReplySink, RegenerationTrigger, SessionConfig, TriggerError};
    use nbe_store::{Database, SqliteStore};
    use serde_json::Value;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tower::ServiceExt;

    struct NullSink;

    #[async_trait]
    impl ReplySink for NullSink {
        async fn reconcile(&self, _: &[Task], _: &[Value]) -> Option<i64> {
            None
        }
    }

    struct NullTrigger;

    #[async_trait]
    impl RegenerationTrigger for NullTrigger {
        async fn regenerate(&self, _: &BTreeSet<i64>) -> Result<(), TriggerError> {
            Ok(())
        }
    }

    fn make_server() -> DispatchServer {
        let hub = Hub::new(
            HubConfig {
                session: SessionConfig {
                    flush: FlushPolicy::new(1, Duration::from_secs(5)),
                    queue_capacity: 16,
                },
                completion: FlushPolicy::new(5, Duration::from_secs(5)),
                liveness_sweep_interval: Duration::from_secs(60),
                liveness_timeout: Duration::from_secs(60),
            },
            Arc::new(NullSink),
            Arc::new(NullTrigger),
        );
        let store = Arc::new(SqliteStore::new(Database::in_memory().unwrap()));
        let metrics = PrometheusBuilder::new().build_recorder().handle();
        DispatchServer::new(ServerConfig::default(), hub, store, metrics)
    }

    fn connect(server: &DispatchServer, host: &str) -> MemoryAgent {
        let (transport, agent) = memory::pair();
        let _ = server.hub().connect(host, Arc::new(transport));
        agent
    }

    fn task_body() -> Body {
        let task = Task::add_container("web", 7, Placement::default());
        Body::from(serde_json::to_vec(&task).unwrap())
    }

    fn post_task(host: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/hosts/{host}/tasks"))
            .header("content-type", "application/json")
            .body(task_body())
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_sessions() {
        let server = make_server();
        let _agent = connect(&server, "10.0.0.1");

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["sessions"], 1);
        assert!(parsed["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text() {
        let server = make_server();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn task_for_connected_host_is_accepted() {
        let server = make_server();
        let mut agent = connect(&server, "10.0.0.1");

        let resp = server.router().oneshot(post_task("10.0.0.1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let group = agent.next_group().await.unwrap();
        assert_eq!(group.name, "web");
        assert_eq!(group.owner_id, 7);
    }

    #[tokio::test]
    async fn task_for_unknown_host_is_404() {
        let server = make_server();
        let resp = server.router().oneshot(post_task("10.9.9.9")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let parsed = body_json(resp).await;
        assert!(parsed["error"].as_str().unwrap().contains("10.9.9.9"));
    }

    #[tokio::test]
    async fn closing_session_is_409() {
        let err = ApiError::from(DispatchError::SessionClosed {
            host: "10.0.0.1".into(),
        });
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(body_json(resp).await["error"].is_string());
    }

    #[tokio::test]
    async fn malformed_task_is_rejected() {
        let server = make_server();
        let req = Request::builder()
            .method("POST")
            .uri("/hosts/10.0.0.1/tasks")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name": 5}"#))
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shutdown_stops_listener() {
        let server = make_server();
        let addr = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.shutdown().tracked(), 1);

        server
            .shutdown()
            .graceful_shutdown(Duration::from_secs(5))
            .await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
