//! Axum webhook server for chat-platform events.
//!
//! Request bodies are capped at 64KB and requests time out after 30s. Event
//! handling itself never waits on AI or gateway calls; those run detached.

pub mod dispatch;

use crate::bridge::GatewayBridge;
use crate::completion::{Completer, CompletionClient};
use crate::config::Config;
use crate::platform::{FeishuClient, Messenger};
use crate::security::{client_ip_from_request, EventVerifier, IpAllowlist, RateLimiter};
use crate::stats::StatsCollector;
use crate::tasks::{TaskRunner, TaskSpawner, TokioSpawner};
use crate::util::truncate_with_ellipsis;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use dispatch::{EventResponse, InboundDispatcher, SimulatedMessage};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<InboundDispatcher>,
    pub bridge: Option<Arc<GatewayBridge>>,
    pub stats: Arc<StatsCollector>,
    pub verifier: Arc<EventVerifier>,
    pub allowlist: Arc<IpAllowlist>,
    /// Result of the most recent gateway health check.
    pub gateway_healthy: Arc<AtomicBool>,
}

/// Collaborators the server is assembled from; tests swap in doubles.
pub struct GatewayParts {
    pub messenger: Arc<dyn Messenger>,
    pub completer: Arc<dyn Completer>,
    pub bridge: Option<Arc<GatewayBridge>>,
    pub spawner: Arc<dyn TaskSpawner>,
}

impl GatewayParts {
    pub fn from_config(config: &Config) -> Self {
        let bridge = config
            .agent_gateway
            .enabled
            .then(|| Arc::new(GatewayBridge::new(&config.agent_gateway)));
        Self {
            messenger: Arc::new(FeishuClient::new(&config.feishu)),
            completer: Arc::new(CompletionClient::new(&config.ai)),
            bridge,
            spawner: Arc::new(TokioSpawner),
        }
    }
}

impl AppState {
    pub fn new(config: Config, parts: GatewayParts) -> Self {
        let stats = Arc::new(StatsCollector::new());
        let runner = TaskRunner::new(
            Arc::clone(&parts.messenger),
            parts.completer,
            Arc::clone(&stats),
        );
        let rate_limiter = Arc::new(RateLimiter::per_minute(
            config.security.rate_limit_per_minute,
        ));
        let dispatcher = InboundDispatcher::new(
            config.feishu.bot_open_id.clone(),
            parts.messenger,
            parts.bridge.clone(),
            runner,
            rate_limiter,
            parts.spawner,
        );
        let verifier = EventVerifier::new(
            config.security.enable_event_verification,
            &config.feishu.verification_token,
            &config.feishu.encrypt_key,
        );
        let allowlist = IpAllowlist::new(
            config.security.enable_ip_whitelist,
            &config.security.ip_whitelist,
        );
        Self {
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            bridge: parts.bridge,
            stats,
            verifier: Arc::new(verifier),
            allowlist: Arc::new(allowlist),
            gateway_healthy: Arc::new(AtomicBool::new(false)),
        }
    }

    fn gateway_status(&self) -> Option<bool> {
        self.bridge
            .as_ref()
            .map(|_| self.gateway_healthy.load(Ordering::Relaxed))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/event", post(handle_event))
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/test/simulate", post(handle_simulate))
        .route("/test/gateway", post(handle_test_gateway))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Run the webhook server until it is shut down with Ctrl+C.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    let verification = config.security.enable_event_verification;
    if !verification {
        tracing::warn!("Event verification is disabled; inbound events are not authenticated");
    } else {
        if config.feishu.verification_token.trim().is_empty() {
            tracing::warn!("FEISHU_VERIFICATION_TOKEN not set; event token check skipped");
        }
        if config.feishu.encrypt_key.trim().is_empty() {
            tracing::warn!("FEISHU_ENCRYPT_KEY not set; event signature check skipped");
        }
    }

    let parts = GatewayParts::from_config(&config);
    let state = AppState::new(config, parts);

    if let Some(bridge) = state.bridge.as_ref() {
        let health = bridge.health_check().await;
        state.gateway_healthy.store(health.healthy, Ordering::Relaxed);
        if health.healthy {
            tracing::info!("Agent gateway reachable at {}", bridge.gateway_url());
        } else {
            tracing::warn!(
                "Agent gateway health check failed: {}",
                health.error.as_deref().unwrap_or("unknown error")
            );
        }
    } else {
        tracing::info!("Agent gateway bridge disabled");
    }

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let actual = listener.local_addr()?;

    tracing::info!(
        app = %state.config.app.name,
        version = %state.config.app.version,
        env = %state.config.app.env,
        "Webhook server listening on http://{actual}"
    );
    tracing::info!("  POST /webhook/event  chat platform events");
    tracing::info!("  GET  /health         health check");
    tracing::info!("  GET  /stats          request and task counters");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Webhook server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {err}");
    }
}

fn error_json(status: StatusCode, msg: &str) -> Response {
    (status, Json(json!({ "code": -1, "msg": msg }))).into_response()
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().to_ascii_lowercase().starts_with("application/json"))
}

/// POST /webhook/event
async fn handle_event(
    State(state): State<AppState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_ip = client_ip_from_request(
        Some(peer_addr),
        &headers,
        state.config.server.trust_forwarded_headers,
    );
    if !state.allowlist.allows(&client_ip) {
        return error_json(StatusCode::FORBIDDEN, "IP not allowed");
    }

    if !is_json_content_type(&headers) {
        tracing::warn!("Rejected non-JSON event request");
        return error_json(
            StatusCode::BAD_REQUEST,
            "Content-Type must be application/json",
        );
    }

    let event: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!("Event JSON parse error: {err}");
            return error_json(StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };

    tracing::debug!(
        "Received event: {}",
        truncate_with_ellipsis(&event.to_string(), 200)
    );

    if !state.verifier.verify_signature(&headers, &body) {
        tracing::warn!("Rejected event with invalid signature");
        state.stats.record_request(false);
        return error_json(StatusCode::UNAUTHORIZED, "Invalid signature");
    }
    if !state.verifier.verify_token(&event) {
        tracing::warn!("Rejected event with invalid verification token");
        state.stats.record_request(false);
        return error_json(StatusCode::UNAUTHORIZED, "Invalid verification token");
    }

    let response = state.dispatcher.dispatch(&event);
    state.stats.record_request(response.is_ok());
    Json(response).into_response()
}

/// GET /health
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats.health_json(&state.config, state.gateway_status()))
}

/// GET /stats
async fn handle_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats.detailed_json(&state.config))
}

/// POST /test/simulate — feed a synthetic message event through the
/// dispatcher. Refused in production.
async fn handle_simulate(State(state): State<AppState>, body: Bytes) -> Response {
    if state.config.app.is_production() {
        return error_json(StatusCode::FORBIDDEN, "Not available in production");
    }

    let simulated: SimulatedMessage = match serde_json::from_slice(&body) {
        Ok(simulated) => simulated,
        Err(err) => {
            tracing::warn!("Simulate JSON parse error: {err}");
            return error_json(StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };

    let response: EventResponse = state.dispatcher.dispatch_message(&simulated.to_event());
    Json(response).into_response()
}

/// POST /test/gateway — health-check the agent gateway and, when healthy,
/// deliver a test message.
async fn handle_test_gateway(State(state): State<AppState>) -> impl IntoResponse {
    let Some(bridge) = state.bridge.as_ref() else {
        return Json(json!({
            "available": false,
            "error": "agent gateway bridge is disabled",
        }));
    };

    let health = bridge.health_check().await;
    state.gateway_healthy.store(health.healthy, Ordering::Relaxed);
    if !health.healthy {
        let error = health.error.clone().unwrap_or_else(|| "unknown error".into());
        return Json(json!({
            "available": false,
            "health": health,
            "error": error,
        }));
    }

    let request = crate::bridge::BridgeRequest {
        text: "Hello".into(),
        sender_id: "test_user".into(),
        sender_name: "test_user".into(),
        ..Default::default()
    };
    let reply = bridge.dispatch(&request).await;
    Json(json!({
        "available": true,
        "health": health,
        "test_result": reply.success,
        "strategy": reply.strategy,
    }))
}
