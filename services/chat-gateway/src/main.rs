//! Multi-provider chat-completion gateway
//!
//! Single-binary service that:
//! 1. Accepts OpenAI-compatible chat requests (streaming SSE or JSON)
//! 2. Selects a credential from the account pool with cooldown-aware
//!    fallback, refreshing OAuth tokens on demand
//! 3. Translates the request to the target provider's wire protocol and
//!    streams a normalised response back

mod assemble;
mod config;
mod dispatch;
mod metrics;
mod models;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway_auth::{ConnectionStore, ProviderKind};
use gateway_pool::Arbiter;
use metrics_exporter_prometheus::PrometheusHandle;
use provider::Registry;

use crate::config::Config;
use crate::dispatch::DispatchContext;

/// TCP connect timeout for the upstream HTTP client (distinct from streaming
/// read time, which is unbounded for long generations)
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum idle connections per host in the reqwest connection pool
const POOL_MAX_IDLE_PER_HOST: usize = 100;

/// How long in-flight requests may drain after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    ctx: Arc<DispatchContext>,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

#[derive(Clone)]
struct ServiceMetrics {
    started_at: Instant,
    requests_total: Arc<AtomicU64>,
    in_flight: Arc<AtomicU64>,
}

impl ServiceMetrics {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// RAII guard keeping the in-flight gauge accurate on every exit path.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Build the axum router with all routes and shared state.
///
/// Probe endpoints live outside the concurrency limit so health checks and
/// Prometheus scrapes are never blocked by slow chat requests occupying all
/// `max_connections` slots.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let chat_routes = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/models", get(models_handler))
        .merge(chat_routes)
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting chat-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        store = %config.store.path.display(),
        strategy = ?config.settings.fallback_strategy,
        combos = config.combos.len(),
        "configuration loaded"
    );

    let store = Arc::new(
        ConnectionStore::load(config.store.path.clone(), config.settings.clone())
            .await
            .context("failed to load connection store")?,
    );
    info!(connections = store.len().await, "connection store ready");

    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build()
        .context("failed to build HTTP client")?;

    let ctx = Arc::new(DispatchContext {
        arbiter: Arc::new(Arbiter::new(store, config.cooldowns.clone())),
        registry: Arc::new(Registry::new(client, config.provider_configs())),
        combos: config.combos.clone(),
        aliases: config.aliases.clone(),
    });

    let state = AppState {
        ctx,
        metrics: ServiceMetrics::new(),
        prometheus,
    };
    let in_flight = state.metrics.in_flight.clone();

    let app = build_router(state, config.server.max_connections);
    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "accepting requests");

    // Graceful shutdown: stop accepting on SIGTERM/SIGINT, drain in-flight
    // requests, and enforce DRAIN_TIMEOUT so a stalled stream cannot block
    // process exit. The timer starts at signal receipt.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "chat-gateway",
        "endpoints": [
            "POST /v1/chat/completions",
            "GET /v1/models",
            "GET /health",
            "GET /metrics",
        ]
    }))
}

/// OpenAI-compatible chat entry point.
async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let _guard = InFlightGuard::enter(&state.metrics.in_flight);
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => {
            let response = assemble::error_response(
                StatusCode::BAD_REQUEST,
                "input_error",
                &format!("malformed request body: {rejection}"),
            );
            metrics::record_request(400, "unknown", started.elapsed().as_secs_f64());
            return response;
        }
    };

    let provider_label = body
        .get("model")
        .and_then(Value::as_str)
        .map(|m| m.split('/').next().unwrap_or(m).to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let response = dispatch::handle_chat(&state.ctx, body).await;
    metrics::record_request(
        response.status().as_u16(),
        &provider_label,
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Pool summary per provider plus overall service health.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.ctx.arbiter.store();
    let now = gateway_auth::now_millis();

    let mut providers = serde_json::Map::new();
    let mut total = 0usize;
    let mut available = 0usize;
    let mut cooling = 0usize;

    for kind in ProviderKind::ALL {
        let connections = store.connections(*kind, false).await;
        if connections.is_empty() {
            continue;
        }
        let provider_total = connections.len();
        let provider_available = connections
            .iter()
            .filter(|c| c.is_active && !c.in_cooldown(now))
            .count();
        let provider_cooling = connections.iter().filter(|c| c.in_cooldown(now)).count();
        total += provider_total;
        available += provider_available;
        cooling += provider_cooling;
        providers.insert(
            kind.to_string(),
            json!({
                "connections_total": provider_total,
                "connections_available": provider_available,
                "connections_cooling_down": provider_cooling,
            }),
        );
    }

    let status = if total > 0 && available == total {
        "healthy"
    } else if available > 0 {
        "degraded"
    } else {
        "unhealthy"
    };

    let body = json!({
        "status": status,
        "uptime_seconds": state.metrics.started_at.elapsed().as_secs(),
        "requests_served": state.metrics.requests_total.load(Ordering::Relaxed),
        "in_flight": state.metrics.in_flight.load(Ordering::Relaxed),
        "connections_total": total,
        "connections_available": available,
        "connections_cooling_down": cooling,
        "providers": providers,
    });

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint — returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Models reachable through the currently configured connections.
async fn models_handler(State(state): State<AppState>) -> impl IntoResponse {
    let active = state.ctx.arbiter.store().active_providers().await;
    let response = models::models_response(&active, state.ctx.combos.keys().cloned());
    Json(serde_json::to_value(response).unwrap_or_else(|_| json!({"object": "list", "data": []})))
}

/// Panics inside the dispatch pipeline become opaque 500 envelopes; stack
/// traces stay in the logs.
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| err.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(panic = %detail, "request handler panicked");
    assemble::error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "internal server error",
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use gateway_auth::{AuthType, Connection, Settings};
    use gateway_pool::CooldownConfig;
    use tower::ServiceExt;

    /// Create a PrometheusHandle for tests without installing a global
    /// recorder; build_recorder() avoids the "recorder already installed"
    /// panic when multiple tests run in the same process.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    async fn test_state(dir: &tempfile::TempDir, connections: Vec<Connection>) -> AppState {
        let store = Arc::new(
            ConnectionStore::load(dir.path().join("connections.json"), Settings::default())
                .await
                .unwrap(),
        );
        for conn in connections {
            store.add(conn).await.unwrap();
        }
        let mut combos = HashMap::new();
        combos.insert("fast".to_string(), vec!["qwen/qwen3-coder-plus".to_string()]);
        AppState {
            ctx: Arc::new(DispatchContext {
                arbiter: Arc::new(Arbiter::new(store, CooldownConfig::default())),
                registry: Arc::new(Registry::new(reqwest::Client::new(), HashMap::new())),
                combos,
                aliases: HashMap::new(),
            }),
            metrics: ServiceMetrics::new(),
            prometheus: test_prometheus_handle(),
        }
    }

    fn active_conn(id: &str, provider: ProviderKind) -> Connection {
        let mut conn = Connection::new(id, provider, AuthType::Oauth);
        conn.access_token = Some(format!("at_{id}"));
        conn
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_pool_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut cooling = active_conn("b", ProviderKind::Claude);
        cooling.rate_limited_until = Some(gateway_auth::now_millis() + 60_000);
        let state = test_state(&dir, vec![active_conn("a", ProviderKind::Claude), cooling]).await;
        let app = build_router(state, 100);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["connections_total"], 2);
        assert_eq!(json["connections_available"], 1);
        assert_eq!(json["providers"]["claude"]["connections_cooling_down"], 1);
        assert!(json.get("uptime_seconds").is_some());
    }

    #[tokio::test]
    async fn health_empty_store_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, vec![]).await;
        let app = build_router(state, 100);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["status"], "unhealthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, vec![]).await;
        let app = build_router(state, 100);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));
    }

    #[tokio::test]
    async fn models_lists_active_providers_and_combos() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, vec![active_conn("q", ProviderKind::Qwen)]).await;
        let app = build_router(state, 100);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        let ids: Vec<&str> = json["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"qwen/qwen3-coder-plus"));
        assert!(ids.contains(&"fast"), "combo should be listed: {ids:?}");
        assert!(!ids.iter().any(|id| id.starts_with("claude/")));
    }

    #[tokio::test]
    async fn malformed_json_body_is_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, vec![]).await;
        let app = build_router(state, 100);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/chat/completions")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "input_error");
    }

    #[tokio::test]
    async fn chat_without_model_is_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, vec![]).await;
        let app = build_router(state, 100);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/chat/completions")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"messages":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], 400);
    }

    #[tokio::test]
    async fn root_lists_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, vec![]).await;
        let app = build_router(state, 100);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert!(
            json["endpoints"]
                .as_array()
                .unwrap()
                .iter()
                .any(|e| e.as_str().unwrap().contains("/v1/chat/completions"))
        );
    }
}
