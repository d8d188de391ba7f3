//! Request dispatcher — classifies `/{chain}/{exec|cons}/{apiKey}/…`
//! URLs, runs the admission pipeline and hands off to the proxy.
//!
//! Proxy traffic is method-agnostic and its path shape is not
//! expressible as fixed routes, so the dispatcher is the router
//! fallback and parses the URL itself. Pipeline per request: parse →
//! registry lookup → chain document check → RPS gate → advisory daily
//! gate → authoritative counter increment (with compensation) →
//! upstream selection → forward. Every terminal state emits exactly
//! one response and one `rpc_requests_total` observation.

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::{to_bytes, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tracing::debug;

use crate::error::GateError;
use crate::metrics::{self, LimitKind};
use crate::pool::Layer;
use crate::proxy;
use crate::{AppState, CorrelationId, MAX_BODY_BYTES};
use gateway_store::TouchOutcome;

/// Parsed shape of a proxy URL.
#[derive(Debug, PartialEq, Eq)]
pub enum ProxyPath {
    /// `/{chain}/{layer}/{key}[/{rest}]`
    Dispatch {
        chain: String,
        layer: Layer,
        api_key: String,
        subpath: String,
    },
    /// A valid chain/layer prefix with no key segment.
    MissingKey,
    /// Not a proxy URL at all.
    NotProxy,
}

/// Split a request path into `(chain, layer, apiKey, subpath)`.
pub fn parse_proxy_path(path: &str) -> ProxyPath {
    let mut segments = path.trim_start_matches('/').splitn(4, '/');
    let chain = segments.next().unwrap_or("");
    let layer = segments.next();
    let api_key = segments.next();
    let subpath = segments.next().unwrap_or("");

    if chain.is_empty() {
        return ProxyPath::NotProxy;
    }
    let Some(layer) = layer.and_then(Layer::from_segment) else {
        return ProxyPath::NotProxy;
    };
    match api_key {
        Some(key) if !key.is_empty() => ProxyPath::Dispatch {
            chain: chain.to_lowercase(),
            layer,
            api_key: key.to_string(),
            subpath: subpath.to_string(),
        },
        _ => ProxyPath::MissingKey,
    }
}

/// Router fallback: every URL that is not a fixed control-plane route
/// lands here.
pub async fn entry(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let correlation_id = req
        .extensions()
        .get::<CorrelationId>()
        .map(|c| c.0.clone())
        .unwrap_or_default();

    match parse_proxy_path(req.uri().path()) {
        ProxyPath::Dispatch {
            chain,
            layer,
            api_key,
            subpath,
        } => dispatch(state, chain, layer, api_key, subpath, addr, correlation_id, req).await,
        ProxyPath::MissingKey => GateError::missing_api_key()
            .with_correlation_id(correlation_id)
            .into_response(),
        ProxyPath::NotProxy => not_found(correlation_id),
    }
}

fn not_found(correlation_id: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(serde_json::json!({
            "code": "not_found",
            "message": "no such route",
            "correlation_id": correlation_id,
        })),
    )
        .into_response()
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: AppState,
    chain: String,
    layer: Layer,
    api_key: String,
    subpath: String,
    addr: SocketAddr,
    correlation_id: String,
    req: Request,
) -> Response {
    let started = Instant::now();
    let key_hash = metrics::api_key_hash(&api_key);

    let (parts, body) = req.into_parts();
    let outcome = admit_and_forward(
        &state,
        &chain,
        layer,
        &api_key,
        &subpath,
        addr,
        parts.method,
        parts.uri.query().map(|q| q.to_string()),
        parts.headers,
        body,
    )
    .await;

    let (response, methods) = match outcome {
        Ok((resp, methods)) => (resp, methods),
        Err((err, methods)) => (
            err.with_correlation_id(correlation_id).into_response(),
            methods,
        ),
    };

    let status = response.status().as_u16();
    let elapsed = started.elapsed().as_secs_f64();
    if methods.is_empty() {
        metrics::record_request(&chain, layer, "", &key_hash, status);
        metrics::record_duration(&chain, layer, "", &key_hash, elapsed);
    } else {
        for method in &methods {
            metrics::record_request(&chain, layer, method, &key_hash, status);
        }
        metrics::record_duration(&chain, layer, &methods[0], &key_hash, elapsed);
    }
    response
}

type DispatchOutcome = Result<(Response, Vec<String>), (GateError, Vec<String>)>;

#[allow(clippy::too_many_arguments)]
async fn admit_and_forward(
    state: &AppState,
    chain: &str,
    layer: Layer,
    api_key: &str,
    subpath: &str,
    addr: SocketAddr,
    method: Method,
    query: Option<String>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> DispatchOutcome {
    let fail = |err: GateError| (err, Vec::new());

    if state.registry.get(chain).is_none() {
        return Err(fail(GateError::unknown_chain(chain)));
    }
    let chain_doc = match state.store.chain_by_name(chain).await {
        Ok(doc) => doc,
        Err(e) => return Err(fail(e.into())),
    };
    if !chain_doc.map(|c| c.is_enabled).unwrap_or(false) {
        return Err(fail(GateError::chain_disabled(chain)));
    }

    // Admission: the app is read once for the cheap checks, then the
    // store increment is the authoritative gate.
    let app = match state.store.app_by_key(api_key).await {
        Ok(Some(app)) => app,
        Ok(None) => return Err(fail(GateError::invalid_key())),
        Err(e) => return Err(fail(e.into())),
    };
    if !app.is_active {
        return Err(fail(GateError::inactive_app()));
    }
    let key_hash = metrics::api_key_hash(api_key);

    if !state.limiter.check(api_key, app.max_rps) {
        metrics::record_rate_limit_hit(LimitKind::Rps, &key_hash);
        return Err(fail(GateError::rate_limited_rps()));
    }

    let today = Utc::now().date_naive();
    let limit = app.daily_requests_limit;
    if limit > 0 && app.last_reset_date == today && app.daily_requests >= limit {
        metrics::record_rate_limit_hit(LimitKind::Daily, &key_hash);
        return Err(fail(GateError::rate_limited_daily()));
    }

    let counted = match state.store.touch_and_count(api_key, today).await {
        Ok(TouchOutcome::Counted(app)) => app,
        Ok(TouchOutcome::InvalidKey) => return Err(fail(GateError::invalid_key())),
        Ok(TouchOutcome::Inactive) => return Err(fail(GateError::inactive_app())),
        Err(e) => return Err(fail(e.into())),
    };
    if limit > 0 && counted.daily_requests > limit {
        // Lost the admission race: undo the increment.
        if let Err(e) = state.store.decrement_daily(&counted.id).await {
            debug!(app = %counted.id, error = %e, "compensation decrement failed");
        }
        metrics::record_rate_limit_hit(LimitKind::Daily, &key_hash);
        return Err(fail(GateError::rate_limited_daily()));
    }

    // Execution bodies are read once for method extraction and re-sent
    // as the same bytes; consensus bodies stream through untouched.
    let (upstream_body, methods) = match layer {
        Layer::Execution => {
            let bytes: Bytes = match to_bytes(body, MAX_BODY_BYTES).await {
                Ok(bytes) => bytes,
                Err(_) => return Err(fail(GateError::bad_request("request body unreadable"))),
            };
            let methods = proxy::extract_rpc_methods(
                &bytes,
                headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok()),
            );
            (proxy::UpstreamBody::Buffered(bytes), methods)
        }
        Layer::Consensus => (proxy::UpstreamBody::Streamed(body), Vec::new()),
    };

    let forwarded = proxy::forward(
        &state.http,
        &state.pool,
        chain,
        layer,
        method,
        subpath,
        query.as_deref(),
        &headers,
        upstream_body,
        Some(addr.ip()),
    )
    .await;

    match forwarded {
        Ok(resp) => Ok((resp, methods)),
        Err(err) => Err((err, methods)),
    }
}
