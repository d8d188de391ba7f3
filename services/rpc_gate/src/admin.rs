//! Admin surface: chain/user/app/default-settings management and the
//! per-chain health and metrics aggregation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::auth::{user_view, AuthUser};
use crate::error::GateError;
use crate::metrics::{api_key_hash, scrape_chain};
use crate::pool::{Endpoint, Layer};
use crate::AppState;
use gateway_store::{AppPatch, Chain, ChainPatch, UserPatch};

// ── Chains ───────────────────────────────────────────────────────────

pub async fn list_chains(State(state): State<AppState>) -> Result<Json<Value>, GateError> {
    let chains = state.store.chains().await?;
    Ok(Json(json!({ "chains": chains })))
}

#[derive(Debug, Deserialize)]
pub struct CreateChainReq {
    pub chain_name: String,
    pub chain_id: u64,
    #[serde(default)]
    pub description: String,
    pub is_enabled: Option<bool>,
}

pub async fn create_chain(
    State(state): State<AppState>,
    Json(req): Json<CreateChainReq>,
) -> Result<(StatusCode, Json<Value>), GateError> {
    if req.chain_name.trim().is_empty() {
        return Err(GateError::bad_request("chain_name is required"));
    }
    let chain = state
        .store
        .create_chain(Chain {
            chain_name: req.chain_name,
            chain_id: req.chain_id,
            description: req.description,
            is_enabled: req.is_enabled.unwrap_or(true),
        })
        .await?;
    info!(chain = %chain.chain_name, id = chain.chain_id, "chain created");
    Ok((StatusCode::CREATED, Json(json!({ "chain": chain }))))
}

#[derive(Debug, Deserialize)]
pub struct UpdateChainReq {
    pub description: Option<String>,
    pub is_enabled: Option<bool>,
}

pub async fn update_chain(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
    Json(req): Json<UpdateChainReq>,
) -> Result<Json<Value>, GateError> {
    let chain = state
        .store
        .update_chain(
            chain_id,
            ChainPatch {
                description: req.description,
                is_enabled: req.is_enabled,
            },
        )
        .await?;
    Ok(Json(json!({ "chain": chain })))
}

pub async fn delete_chain(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
) -> Result<StatusCode, GateError> {
    state.store.delete_chain(chain_id).await?;
    info!(id = chain_id, "chain deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ── Apps (admin view: limits and status) ─────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AdminUpdateAppReq {
    pub max_rps: Option<u32>,
    pub daily_requests_limit: Option<u64>,
    pub is_active: Option<bool>,
}

pub async fn update_app(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    Json(req): Json<AdminUpdateAppReq>,
) -> Result<Json<Value>, GateError> {
    let app = state
        .store
        .update_app(
            &app_id,
            AppPatch {
                max_rps: req.max_rps,
                daily_requests_limit: req.daily_requests_limit,
                is_active: req.is_active,
                ..Default::default()
            },
        )
        .await?;
    // Admin listings never expose the key itself.
    Ok(Json(json!({
        "app": {
            "id": app.id,
            "owner_user_id": app.owner_user_id,
            "name": app.name,
            "chain_name": app.chain_name,
            "api_key_hash": api_key_hash(&app.api_key),
            "max_rps": app.max_rps,
            "daily_requests_limit": app.daily_requests_limit,
            "is_active": app.is_active,
            "requests": app.requests,
            "daily_requests": app.daily_requests,
        }
    })))
}

// ── Users ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AdminUpdateUserReq {
    pub is_active: Option<bool>,
    pub is_admin: Option<bool>,
}

pub async fn update_user(
    State(state): State<AppState>,
    Extension(AuthUser(caller)): Extension<AuthUser>,
    Path(user_id): Path<String>,
    Json(req): Json<AdminUpdateUserReq>,
) -> Result<Json<Value>, GateError> {
    if caller.id == user_id && req.is_admin == Some(false) {
        return Err(GateError::bad_request("cannot revoke your own admin flag"));
    }
    let user = state
        .store
        .update_user(
            &user_id,
            UserPatch {
                is_active: req.is_active,
                is_admin: req.is_admin,
            },
        )
        .await?;
    Ok(Json(json!({ "user": user_view(&user) })))
}

// ── Default app settings ─────────────────────────────────────────────

pub async fn get_defaults(State(state): State<AppState>) -> Result<Json<Value>, GateError> {
    let defaults = state.store.default_app_settings().await?;
    Ok(Json(json!({ "default_app_settings": defaults })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateDefaultsReq {
    pub default_max_rps: Option<u32>,
    pub default_daily_requests_limit: Option<u64>,
}

pub async fn update_defaults(
    State(state): State<AppState>,
    Json(req): Json<UpdateDefaultsReq>,
) -> Result<Json<Value>, GateError> {
    let defaults = state
        .store
        .update_default_app_settings(req.default_max_rps, req.default_daily_requests_limit)
        .await?;
    info!(
        max_rps = defaults.default_max_rps,
        daily = defaults.default_daily_requests_limit,
        "default app settings updated"
    );
    Ok(Json(json!({ "default_app_settings": defaults })))
}

// ── Node health & metrics aggregation ────────────────────────────────

fn node_snapshot(ep: &Endpoint) -> Value {
    json!({
        "url": ep.url,
        "healthy": ep.is_healthy(),
        "in_flight": ep.in_flight(),
        "consecutive_failures": ep.consecutive_failures(),
    })
}

fn layer_report(state: &AppState, chain: &str, layer: Layer) -> (Value, Option<bool>) {
    let endpoints = state.pool.endpoints(chain, layer);
    if endpoints.is_empty() {
        return (json!({ "status": "unconfigured", "nodes": [] }), None);
    }
    let nodes: Vec<Value> = endpoints.iter().map(|ep| node_snapshot(ep)).collect();
    let healthy = endpoints.iter().any(|ep| ep.is_healthy());
    (
        json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "nodes": nodes,
        }),
        Some(healthy),
    )
}

/// `GET /admin/node-health/{chain}` (also served publicly as
/// `GET /health/{chain}`): merged probe state plus the metrics scrape.
pub async fn node_health(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> Result<Json<Value>, GateError> {
    let chain = chain.to_lowercase();
    let Some(entry) = state.registry.get(&chain) else {
        return Err(GateError::unknown_chain(&chain));
    };

    let (execution, exec_healthy) = layer_report(&state, &chain, Layer::Execution);
    let (consensus, cons_healthy) = layer_report(&state, &chain, Layer::Consensus);
    let metrics = scrape_chain(&state.http, &entry.prometheus).await;

    // Healthy iff every configured layer has at least one healthy node.
    let layers: Vec<bool> = [exec_healthy, cons_healthy].into_iter().flatten().collect();
    let overall = if layers.is_empty() {
        "unconfigured"
    } else if layers.iter().all(|h| *h) {
        "healthy"
    } else {
        "degraded"
    };

    Ok(Json(json!({
        "chain": chain,
        "execution": execution,
        "consensus": consensus,
        "metrics": metrics,
        "overall": overall,
    })))
}

/// `GET /admin/node-metrics/{chain}`: the raw scrape fan-out.
pub async fn node_metrics(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> Result<Json<Value>, GateError> {
    let chain = chain.to_lowercase();
    let Some(entry) = state.registry.get(&chain) else {
        return Err(GateError::unknown_chain(&chain));
    };
    let aggregate = scrape_chain(&state.http, &entry.prometheus).await;
    Ok(Json(json!({ "chain": chain, "metrics": aggregate })))
}
