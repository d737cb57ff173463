use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tether_core::close::CloseCode;
use tether_core::envelope::WebSocketMessage;
use tether_core::filter::MessageFilter;
use tether_core::ids::AccountId;
use tether_core::stats::ConnectionStats;
use tether_telemetry::MetricsRecorder;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::TokenVerifier;
use crate::config::ServerConfig;
use crate::directory::AccountDirectory;
use crate::handshake::{self, error_response, HandshakeError, HandshakeQuery};
use crate::manager::ManagerLimits;
use crate::now_ms;
use crate::registry::Frame;
use crate::shutdown::ShutdownCoordinator;
use crate::socket::{self, SocketSettings};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<AccountDirectory>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub metrics: Arc<MetricsRecorder>,
    pub socket_settings: SocketSettings,
    pub max_message_size: usize,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: &ServerConfig, verifier: Arc<dyn TokenVerifier>, metrics: Arc<MetricsRecorder>) -> Self {
        let limits = ManagerLimits {
            max_connections: config.max_connections_per_account,
            idle_timeout_ms: i64::try_from(config.idle_timeout().as_millis()).unwrap_or(i64::MAX),
        };
        Self {
            directory: Arc::new(AccountDirectory::new(limits, Arc::clone(&metrics))),
            verifier,
            metrics,
            socket_settings: SocketSettings {
                heartbeat_interval: config.heartbeat_interval(),
                max_send_queue: config.max_send_queue,
            },
            max_message_size: config.max_message_size,
            started_at: Instant::now(),
        }
    }
}

/// Body of `POST /broadcast`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub message: WebSocketMessage,
    pub filter: MessageFilter,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResponse {
    pub success: bool,
    pub delivered: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"healthy"` while the server is running.
    pub status: String,
    pub connections: usize,
    pub accounts: usize,
    pub uptime_secs: u64,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/websocket", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/broadcast", post(broadcast_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HandshakeQuery>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !is_websocket_upgrade(&headers) {
        return reject(&state, HandshakeError::UpgradeRequired);
    }

    let accepted = match handshake::authenticate(&query, state.verifier.as_ref()).await {
        Ok(accepted) => accepted,
        Err(e) => return reject(&state, e),
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            state
                .metrics
                .counter_inc("connections_rejected_total", &[("reason", "upgrade")], 1);
            return rejection.into_response();
        }
    };

    let directory = Arc::clone(&state.directory);
    let settings = state.socket_settings;
    upgrade
        .max_message_size(state.max_message_size)
        .on_upgrade(move |socket| socket::serve_socket(socket, accepted, directory, settings))
}

fn reject(state: &AppState, err: HandshakeError) -> Response {
    warn!(code = err.error_code(), error = %err, "handshake rejected");
    state
        .metrics
        .counter_inc("connections_rejected_total", &[("reason", err.error_code())], 1);
    err.into_response()
}

/// Resolve the caller's account from `Authorization: Bearer <token>`.
async fn bearer_account(state: &AppState, headers: &HeaderMap) -> Result<AccountId, Response> {
    let unauthorized = |message: &str| error_response(StatusCode::UNAUTHORIZED, "AUTH_FAILED", message);
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| unauthorized("missing bearer token"))?;
    state
        .verifier
        .verify(token)
        .await
        .map(|v| v.account_id)
        .map_err(|e| unauthorized(&e.to_string()))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        connections: state.directory.total_connections(),
        accounts: state.directory.account_count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn stats_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let account_id = match bearer_account(&state, &headers).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let stats = state
        .directory
        .get(&account_id)
        .map(|m| m.stats())
        .unwrap_or_else(|| ConnectionStats::from_connections(std::iter::empty()));
    Json(stats).into_response()
}

async fn broadcast_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let account_id = match bearer_account(&state, &headers).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let request: BroadcastRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "INVALID_JSON", e.to_string()),
    };
    let text = match request.message.to_json() {
        Ok(text) => text,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "INVALID_JSON", e.to_string()),
    };

    let delivered = state
        .directory
        .get(&account_id)
        .map_or(0, |m| m.broadcast(Frame::Text(text), &request.filter));
    info!(
        account_id = %account_id,
        filter = request.filter.kind(),
        delivered,
        "broadcast"
    );
    Json(BroadcastResponse {
        success: true,
        delivered,
    })
    .into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    Json(state.metrics.snapshot()).into_response()
}

/// Periodically close idle sockets until `token` is cancelled. Accounts
/// that were silent for a whole interval are hibernated.
fn spawn_idle_sweeper(
    directory: Arc<AccountDirectory>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    let quiet_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let now = now_ms();
                    let closed = directory.close_idle(now);
                    let hibernated = directory.hibernate_quiet(now, quiet_ms);
                    if closed > 0 || hibernated > 0 {
                        info!(closed, hibernated, "idle connection sweep");
                    }
                }
            }
        }
    })
}

/// Bind, serve, and start background tasks.
pub async fn start(
    config: &ServerConfig,
    verifier: Arc<dyn TokenVerifier>,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(config, verifier, metrics);
    let directory = Arc::clone(&state.directory);
    let coordinator = ShutdownCoordinator::new();

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;

    let router = build_router(state);
    let token = coordinator.token();
    let server = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(token.cancelled_owned())
            .await;
        if let Err(e) = served {
            warn!(error = %e, "server stopped with error");
        }
    });
    let sweeper = spawn_idle_sweeper(
        Arc::clone(&directory),
        config.idle_sweep_interval(),
        coordinator.token(),
    );

    info!(%addr, "tether relay listening");

    Ok(ServerHandle {
        addr,
        directory,
        coordinator,
        tasks: vec![server, sweeper],
        shutdown_timeout: config.shutdown_timeout(),
    })
}

/// Handle returned by [`start`]. Keeps the listener alive until shut down.
pub struct ServerHandle {
    pub addr: SocketAddr,
    directory: Arc<AccountDirectory>,
    coordinator: ShutdownCoordinator,
    tasks: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn directory(&self) -> Arc<AccountDirectory> {
        Arc::clone(&self.directory)
    }

    /// Close every socket with 1001, stop accepting, and wait for tasks.
    pub async fn shutdown(self) {
        let closed = self.directory.close_all(CloseCode::GoingAway);
        info!(closed, "closing live connections for shutdown");
        self.coordinator
            .graceful_shutdown(self.tasks, self.shutdown_timeout)
            .await;
    }
}
