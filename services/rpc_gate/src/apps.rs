//! Tenant app surface — create, list, inspect, update, delete, and
//! regenerate the API key.
//!
//! Limits come from the default-settings singleton unless the request
//! names them; only the admin surface may change limits afterwards.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::auth::AuthUser;
use crate::error::GateError;
use crate::AppState;
use gateway_store::{App, AppPatch, NewApp};

/// Owner view of an app document. The API key appears here and nowhere
/// else.
pub fn app_view(app: &App) -> Value {
    json!({
        "id": app.id,
        "owner_user_id": app.owner_user_id,
        "name": app.name,
        "description": app.description,
        "chain_name": app.chain_name,
        "chain_id": app.chain_id,
        "api_key": app.api_key,
        "max_rps": app.max_rps,
        "daily_requests_limit": app.daily_requests_limit,
        "is_active": app.is_active,
        "requests": app.requests,
        "daily_requests": app.daily_requests,
        "last_reset_date": app.last_reset_date.to_string(),
        "created_at": app.created_at.to_rfc3339(),
        "updated_at": app.updated_at.to_rfc3339(),
    })
}

async fn owned_app(state: &AppState, user: &gateway_store::User, app_id: &str) -> Result<App, GateError> {
    let app = state
        .store
        .app(app_id)
        .await?
        .ok_or_else(|| GateError::not_found("app"))?;
    if app.owner_user_id != user.id && !user.is_admin {
        return Err(GateError::forbidden("not your app"));
    }
    Ok(app)
}

#[derive(Debug, Deserialize)]
pub struct CreateAppReq {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub chain_name: String,
    pub max_rps: Option<u32>,
    pub daily_requests_limit: Option<u64>,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<CreateAppReq>,
) -> Result<(StatusCode, Json<Value>), GateError> {
    if req.name.trim().is_empty() {
        return Err(GateError::bad_request("app name is required"));
    }
    let chain_name = req.chain_name.trim().to_lowercase();
    if state.registry.get(&chain_name).is_none() {
        return Err(GateError::unknown_chain(&chain_name));
    }
    let chain = state
        .store
        .chain_by_name(&chain_name)
        .await?
        .ok_or_else(|| GateError::chain_disabled(&chain_name))?;
    let defaults = state.store.default_app_settings().await?;
    let app = state
        .store
        .create_app(NewApp {
            owner_user_id: user.id.clone(),
            name: req.name.trim().to_string(),
            description: req.description,
            chain_name: chain.chain_name,
            chain_id: chain.chain_id,
            max_rps: req.max_rps.unwrap_or(defaults.default_max_rps),
            daily_requests_limit: req
                .daily_requests_limit
                .unwrap_or(defaults.default_daily_requests_limit),
        })
        .await?;
    info!(app = %app.id, owner = %user.id, chain = %app.chain_name, "app created");
    Ok((StatusCode::CREATED, Json(json!({ "app": app_view(&app) }))))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Value>, GateError> {
    let apps = state.store.apps_by_owner(&user.id).await?;
    let views: Vec<Value> = apps.iter().map(app_view).collect();
    Ok(Json(json!({ "apps": views })))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(app_id): Path<String>,
) -> Result<Json<Value>, GateError> {
    let app = owned_app(&state, &user, &app_id).await?;
    Ok(Json(json!({ "app": app_view(&app) })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateAppReq {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

pub async fn update(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(app_id): Path<String>,
    Json(req): Json<UpdateAppReq>,
) -> Result<Json<Value>, GateError> {
    owned_app(&state, &user, &app_id).await?;
    let app = state
        .store
        .update_app(
            &app_id,
            AppPatch {
                name: req.name,
                description: req.description,
                is_active: req.is_active,
                ..Default::default()
            },
        )
        .await?;
    Ok(Json(json!({ "app": app_view(&app) })))
}

pub async fn remove(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(app_id): Path<String>,
) -> Result<StatusCode, GateError> {
    owned_app(&state, &user, &app_id).await?;
    state.store.delete_app(&app_id).await?;
    info!(app = %app_id, "app deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn regenerate_key(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(app_id): Path<String>,
) -> Result<Json<Value>, GateError> {
    owned_app(&state, &user, &app_id).await?;
    let api_key = state.store.regenerate_api_key(&app_id).await?;
    info!(app = %app_id, "api key regenerated");
    Ok(Json(json!({ "api_key": api_key })))
}
