//! User auth surface: registration, login, account — plus the bearer
//! middleware the apps/admin surfaces sit behind.
//!
//! Tokens are HS256 JWTs carrying `{sub, email, admin, iat, exp}`.
//! Admin routes require the claim AND `is_admin && is_active` on the
//! live user document, so a demotion takes effect before the token
//! expires.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
    Json,
};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::GateError;
use crate::AppState;
use gateway_store::User;

const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;
const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub admin: bool,
    pub iat: i64,
    pub exp: i64,
}

/// The authenticated principal, injected into request extensions by the
/// middleware below.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

pub fn issue_token(secret: &str, user: &User) -> Result<String, GateError> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user.id.clone(),
        email: user.email.clone(),
        admin: user.is_admin,
        iat: now,
        exp: now + TOKEN_TTL_SECS,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| GateError::internal(format!("token encoding failed: {e}")))
}

pub fn verify_token(secret: &str, token: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .ok()
}

pub fn hash_password(password: &str) -> Result<String, GateError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| GateError::internal(format!("password hashing failed: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Extract the bearer token from a request's `Authorization` header.
fn bearer_token(req: &Request) -> Result<&str, GateError> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| GateError::unauthorized("missing Authorization: Bearer <token> header"))
}

/// Resolve a bearer token to its live user document.
async fn resolve_bearer(state: &AppState, token: &str) -> Result<User, GateError> {
    let claims = verify_token(&state.config.jwt_secret, token)
        .ok_or_else(|| GateError::unauthorized("invalid or expired token"))?;
    let user = state
        .store
        .user(&claims.sub)
        .await?
        .ok_or_else(|| GateError::unauthorized("account no longer exists"))?;
    if !user.is_active {
        return Err(GateError::forbidden("account is deactivated"));
    }
    Ok(user)
}

/// Middleware for the account/apps surface: any active user.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, GateError> {
    let token = bearer_token(&req)?.to_string();
    let user = resolve_bearer(&state, &token).await?;
    req.extensions_mut().insert(AuthUser(user));
    Ok(next.run(req).await)
}

/// Middleware for the admin surface: active admin only.
pub async fn require_admin(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, GateError> {
    let token = bearer_token(&req)?.to_string();
    let user = resolve_bearer(&state, &token).await?;
    if !user.is_admin {
        return Err(GateError::forbidden("admin privileges required"));
    }
    req.extensions_mut().insert(AuthUser(user));
    Ok(next.run(req).await)
}

// ── Handlers ─────────────────────────────────────────────────────────

/// Public view of a user document.
pub fn user_view(user: &User) -> Value {
    json!({
        "id": user.id,
        "email": user.email,
        "is_active": user.is_active,
        "is_admin": user.is_admin,
        "created_at": user.created_at.to_rfc3339(),
        "updated_at": user.updated_at.to_rfc3339(),
    })
}

#[derive(Debug, Deserialize)]
pub struct RegisterReq {
    pub email: String,
    pub password: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterReq>,
) -> Result<(axum::http::StatusCode, Json<Value>), GateError> {
    let email = req.email.trim().to_lowercase();
    if !email.contains('@') || email.len() < 3 {
        return Err(GateError::bad_request("a valid email is required"));
    }
    if req.password.len() < MIN_PASSWORD_LEN {
        return Err(GateError::bad_request(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    let password_hash = hash_password(&req.password)?;
    // The first account on a fresh deployment becomes the admin; the
    // store decides atomically with the insert.
    let user = state
        .store
        .create_user(&email, &password_hash)
        .await
        .map_err(|e| match e {
            gateway_store::StoreError::Duplicate(_) => {
                GateError::conflict("email already registered")
            }
            other => other.into(),
        })?;
    info!(email = %user.email, admin = user.is_admin, "user registered");
    Ok((
        axum::http::StatusCode::CREATED,
        Json(json!({ "user": user_view(&user) })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct LoginReq {
    pub email: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginReq>,
) -> Result<Json<Value>, GateError> {
    let user = state.store.user_by_email(&req.email).await?;
    // One rejection path regardless of which check failed.
    let authenticated = user
        .as_ref()
        .filter(|u| u.is_active && verify_password(&req.password, &u.password_hash));
    let Some(user) = authenticated else {
        return Err(GateError::unauthorized("invalid email or password"));
    };
    let token = issue_token(&state.config.jwt_secret, user)?;
    Ok(Json(json!({ "token": token, "user": user_view(user) })))
}

pub async fn account(
    axum::Extension(AuthUser(user)): axum::Extension<AuthUser>,
) -> Json<Value> {
    Json(json!({ "user": user_view(&user) }))
}
