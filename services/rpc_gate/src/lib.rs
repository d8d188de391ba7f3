//! Multi-tenant JSON-RPC / REST gateway.
//!
//! Inbound traffic arrives on `/{chain}/exec/{apiKey}/…` (JSON-RPC) or
//! `/{chain}/cons/{apiKey}/…` (beacon REST); the gateway authenticates
//! the key, enforces per-app RPS and daily quotas, picks a healthy
//! upstream and forwards with body fidelity. A JWT-protected control
//! plane manages users, apps, chains and defaults.

pub mod admin;
pub mod apps;
pub mod auth;
pub mod dispatch;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod pool;
pub mod prober;
pub mod proxy;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderValue;
use axum::{
    extract::{MatchedPath, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use ::metrics::{counter, histogram};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

use gateway_config::GatewayConfig;
use gateway_store::{DefaultAppSettings, MemStore};

use crate::limiter::RateLimiter;
use crate::pool::UpstreamPool;
use crate::registry::ChainRegistry;

/// Max request body size: 2 MiB (JSON-RPC payloads are small; raw
/// transaction blobs fit comfortably).
pub const MAX_BODY_BYTES: usize = 2 * 1_048_576;
/// Inbound request timeout. Kept above the upstream deadline so
/// upstream timeouts surface as 504 rather than a generic inbound 408.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(70);

/// Correlation id for a request, echoed in `X-Correlation-Id`.
#[derive(Clone)]
pub struct CorrelationId(pub String);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<MemStore>,
    pub registry: Arc<ChainRegistry>,
    pub pool: Arc<UpstreamPool>,
    pub limiter: Arc<RateLimiter>,
    pub http: reqwest::Client,
    pub metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
    pub started_at: Instant,
}

impl AppState {
    /// Build the full state from configuration and seed a chain
    /// document for every configured chain that has none.
    pub async fn new(config: GatewayConfig) -> Self {
        let store = Arc::new(MemStore::new(DefaultAppSettings {
            default_max_rps: config.default_max_rps,
            default_daily_requests_limit: config.default_daily_requests,
        }));
        let registry = Arc::new(ChainRegistry::new(config.chains.clone()));
        let pool = Arc::new(UpstreamPool::from_chains(config.chains.iter()));
        for name in registry.chain_names() {
            if let Err(e) = store.ensure_chain(&name).await {
                tracing::warn!(chain = %name, error = %e, "chain seeding failed");
            }
        }
        let metrics_handle = if config.enable_metrics {
            metrics::install_recorder()
        } else {
            None
        };
        Self {
            config: Arc::new(config),
            store,
            registry,
            pool,
            limiter: Arc::new(RateLimiter::new()),
            // Redirects pass through to the caller untouched.
            http: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("http client"),
            metrics_handle,
            started_at: Instant::now(),
        }
    }
}

pub fn app_with_state(state: AppState) -> Router {
    let protected = Router::new()
        .route("/auth/account", get(auth::account))
        .route("/apps", post(apps::create).get(apps::list))
        .route(
            "/apps/:app_id",
            get(apps::get).patch(apps::update).delete(apps::remove),
        )
        .route("/apps/:app_id/regenerate-key", post(apps::regenerate_key))
        .layer(middleware::from_fn_with_state::<_, AppState, (State<AppState>, Request)>(
            state.clone(),
            auth::require_auth,
        ));

    let admin_routes = Router::new()
        .route(
            "/admin/chains",
            get(admin::list_chains).post(admin::create_chain),
        )
        .route(
            "/admin/chains/:chain_id",
            patch(admin::update_chain).delete(admin::delete_chain),
        )
        .route("/admin/apps/:app_id", patch(admin::update_app))
        .route("/admin/users/:user_id", patch(admin::update_user))
        .route(
            "/admin/default-app-settings",
            get(admin::get_defaults).patch(admin::update_defaults),
        )
        .route("/admin/node-health/:chain", get(admin::node_health))
        .route("/admin/node-metrics/:chain", get(admin::node_metrics))
        .layer(middleware::from_fn_with_state::<_, AppState, (State<AppState>, Request)>(
            state.clone(),
            auth::require_admin,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/health/:chain", get(admin::node_health))
        .route("/metrics", get(metrics_endpoint))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .merge(protected)
        .merge(admin_routes)
        .fallback(dispatch::entry)
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(middleware::from_fn(http_metrics_middleware))
        .layer(middleware::from_fn(correlation_middleware))
        .with_state(state)
}

/// Middleware: every request gets a correlation id (inbound one is
/// kept when present) and the response echoes it.
async fn correlation_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 64)
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(CorrelationId(id.clone()));
    let mut resp = next.run(req).await;
    if let Ok(v) = HeaderValue::from_str(&id) {
        resp.headers_mut().insert("x-correlation-id", v);
    }
    resp
}

/// Middleware: coarse per-route counters. Labels use the matched route
/// pattern, never the raw path, so API keys stay out of the exposition;
/// fallback traffic (the proxy data plane) is grouped under one label.
async fn http_metrics_middleware(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "proxy".to_string());
    let method = req.method().to_string();
    let start = Instant::now();
    let resp = next.run(req).await;
    let status = resp.status().as_u16().to_string();
    let elapsed = start.elapsed().as_secs_f64();

    counter!("gateway_http_requests_total", "route" => route.clone(), "status" => status, "method" => method.clone())
        .increment(1);
    histogram!("gateway_http_request_duration_seconds", "route" => route, "method" => method)
        .record(elapsed);
    resp
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let database = match state.store.ping().await {
        Ok(()) => "ok",
        Err(_) => "unavailable",
    };
    Json(json!({
        "status": "ok",
        "services": {
            "database": database,
            "memory": { "rss_bytes": rss_bytes() },
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        }
    }))
}

#[cfg(target_os = "linux")]
fn rss_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| s.split_whitespace().nth(1).and_then(|v| v.parse::<u64>().ok()))
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn rss_bytes() -> u64 {
    0
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    if !state.config.enable_metrics {
        return error::GateError::not_found("metrics").into_response();
    }
    match &state.metrics_handle {
        Some(handle) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::OK, "# no metrics recorder installed\n").into_response(),
    }
}

pub mod test {
    use super::*;
    use tokio::net::TcpListener;

    /// Spawn the gateway on a random port. Returns the address and a
    /// JoinHandle that keeps the server alive until dropped.
    pub async fn spawn(state: AppState) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let app = app_with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (addr, handle)
    }

    /// A config with no chains and a fixed secret, for control-plane
    /// tests.
    pub fn test_config() -> GatewayConfig {
        GatewayConfig::from_vars([
            ("JWT_SECRET".to_string(), "test-secret".to_string()),
        ])
        .unwrap()
    }
}
