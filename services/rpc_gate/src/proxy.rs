//! Reverse proxy — forwards an admitted request to a pool-selected
//! upstream with body and header fidelity.
//!
//! Execution-layer bodies are buffered once (the dispatcher already
//! read them for method extraction) and re-sent with a correct
//! `Content-Length`; a connection error or upstream 5xx counts one
//! failure against that endpoint and is retried exactly once on a
//! different one. Consensus-layer bodies stream through untouched — a
//! consumed stream cannot be resent, so the failover retry applies to
//! the execution layer only and a consensus connection failure
//! surfaces directly. Responses stream back unchanged either way;
//! upstream 4xx passes through untouched.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::error::GateError;
use crate::metrics;
use crate::pool::{Layer, PoolError, UpstreamPool};

/// Value of the `X-RPC-Gateway` response header.
pub const GATEWAY_TAG: &str = concat!("rpc-gate/", env!("CARGO_PKG_VERSION"));

/// Deadline for one upstream attempt, derived from the inbound budget.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers the gateway owns in the upstream direction.
const STRIPPED_REQUEST: &[&str] = &["host", "authorization", "content-length"];

/// Extract JSON-RPC method names from an execution-layer body. An
/// object yields one method, a batch one per element, anything else
/// (non-JSON, wrong content type, missing field) yields none.
pub fn extract_rpc_methods(body: &[u8], content_type: Option<&str>) -> Vec<String> {
    let is_json = content_type
        .map(|ct| ct.trim_start().starts_with("application/json"))
        .unwrap_or(false);
    if !is_json || body.is_empty() {
        return vec![];
    }
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return vec![];
    };
    match value {
        serde_json::Value::Object(obj) => obj
            .get("method")
            .and_then(|m| m.as_str())
            .map(|m| vec![m.to_string()])
            .unwrap_or_default(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("method").and_then(|m| m.as_str()))
            .map(|m| m.to_string())
            .collect(),
        _ => vec![],
    }
}

/// Build the upstream request headers: inbound headers minus hop-by-hop
/// and gateway-owned ones, with the client appended to
/// `X-Forwarded-For`.
pub fn upstream_headers(inbound: &HeaderMap, client_ip: Option<IpAddr>) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) || STRIPPED_REQUEST.contains(&lower.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    if let Some(ip) = client_ip {
        let forwarded = match inbound
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(prior) => format!("{prior}, {ip}"),
            None => ip.to_string(),
        };
        if let Ok(v) = HeaderValue::from_str(&forwarded) {
            out.insert(HeaderName::from_static("x-forwarded-for"), v);
        }
    }
    out
}

/// Join an upstream base URL with the request subpath and query.
pub fn target_url(base: &str, subpath: &str, query: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    let mut url = if subpath.is_empty() {
        format!("{base}/")
    } else {
        format!("{base}/{}", subpath.trim_start_matches('/'))
    };
    if let Some(q) = query {
        url.push('?');
        url.push_str(q);
    }
    url
}

/// Request body in the upstream direction.
pub enum UpstreamBody {
    /// Re-sendable bytes (execution layer) — enables the single
    /// failover retry.
    Buffered(Bytes),
    /// The inbound stream, forwarded as-is (consensus layer) — consumed
    /// by the first attempt, so no retry.
    Streamed(Body),
}

/// Forward one admitted request. Selection, failover and response
/// decoration happen here; admission already happened in the
/// dispatcher.
#[allow(clippy::too_many_arguments)]
pub async fn forward(
    client: &reqwest::Client,
    pool: &UpstreamPool,
    chain: &str,
    layer: Layer,
    method: Method,
    subpath: &str,
    query: Option<&str>,
    inbound_headers: &HeaderMap,
    body: UpstreamBody,
    client_ip: Option<IpAddr>,
) -> Result<Response, GateError> {
    let headers = upstream_headers(inbound_headers, client_ip);
    match body {
        UpstreamBody::Buffered(bytes) => {
            forward_buffered(client, pool, chain, layer, method, subpath, query, headers, bytes)
                .await
        }
        UpstreamBody::Streamed(inbound) => {
            forward_streamed(client, pool, chain, layer, method, subpath, query, headers, inbound)
                .await
        }
    }
}

async fn acquire_lease(
    pool: &UpstreamPool,
    chain: &str,
    layer: Layer,
    skip: Option<&str>,
    attempted: &[String],
) -> Result<crate::pool::Lease, GateError> {
    match pool.acquire(chain, layer, skip).await {
        Ok(lease) => Ok(lease),
        Err(PoolError::NoEndpoints) => Err(GateError::no_healthy_upstream(
            chain,
            layer.as_str(),
            attempted.to_vec(),
        )),
        Err(PoolError::Saturated) => Err(GateError::upstream_saturated(chain, layer.as_str())),
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward_buffered(
    client: &reqwest::Client,
    pool: &UpstreamPool,
    chain: &str,
    layer: Layer,
    method: Method,
    subpath: &str,
    query: Option<&str>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GateError> {
    let mut attempted: Vec<String> = Vec::new();
    let mut skip: Option<String> = None;

    for _attempt in 0..2 {
        let lease = acquire_lease(pool, chain, layer, skip.as_deref(), &attempted).await?;
        let url = lease.endpoint.url.clone();
        let target = target_url(&url, subpath, query);
        if lease.degraded {
            debug!(chain, layer = %layer, url = %url, "no healthy upstream, probing optimistically");
        }

        let started = Instant::now();
        let result = client
            .request(method.clone(), target.as_str())
            .headers(headers.clone())
            .body(body.clone())
            .timeout(UPSTREAM_TIMEOUT)
            .send()
            .await;

        match result {
            Err(e) if e.is_timeout() => {
                mark_failure(&lease.endpoint);
                attempted.push(url.clone());
                return Err(GateError::upstream_timeout(chain, layer.as_str(), &url));
            }
            Err(e) => {
                warn!(chain, layer = %layer, url = %url, error = %e, "upstream connection failed");
                mark_failure(&lease.endpoint);
                attempted.push(url.clone());
                skip = Some(url);
            }
            Ok(resp) if resp.status().is_server_error() => {
                warn!(chain, layer = %layer, url = %url, status = %resp.status(), "upstream server error");
                mark_failure(&lease.endpoint);
                attempted.push(url.clone());
                skip = Some(url);
            }
            Ok(resp) => {
                lease.endpoint.clear_failures();
                return Ok(decorate(resp, layer, started.elapsed(), lease));
            }
        }
    }

    Err(GateError::no_healthy_upstream(
        chain,
        layer.as_str(),
        attempted,
    ))
}

/// Single-attempt path for streamed bodies: the stream is consumed by
/// the send, so a failure marks the endpoint and surfaces without
/// retrying. Upstream 5xx still counts toward unhealthy but the
/// response passes through.
#[allow(clippy::too_many_arguments)]
async fn forward_streamed(
    client: &reqwest::Client,
    pool: &UpstreamPool,
    chain: &str,
    layer: Layer,
    method: Method,
    subpath: &str,
    query: Option<&str>,
    headers: HeaderMap,
    inbound: Body,
) -> Result<Response, GateError> {
    let lease = acquire_lease(pool, chain, layer, None, &[]).await?;
    let url = lease.endpoint.url.clone();
    let target = target_url(&url, subpath, query);
    if lease.degraded {
        debug!(chain, layer = %layer, url = %url, "no healthy upstream, probing optimistically");
    }

    let started = Instant::now();
    let result = client
        .request(method, target.as_str())
        .headers(headers)
        .body(reqwest::Body::wrap_stream(inbound.into_data_stream()))
        .timeout(UPSTREAM_TIMEOUT)
        .send()
        .await;

    match result {
        Err(e) if e.is_timeout() => {
            mark_failure(&lease.endpoint);
            Err(GateError::upstream_timeout(chain, layer.as_str(), &url))
        }
        Err(e) => {
            warn!(chain, layer = %layer, url = %url, error = %e, "upstream connection failed");
            mark_failure(&lease.endpoint);
            Err(GateError::no_healthy_upstream(
                chain,
                layer.as_str(),
                vec![url],
            ))
        }
        Ok(resp) => {
            if resp.status().is_server_error() {
                warn!(chain, layer = %layer, url = %url, status = %resp.status(), "upstream server error");
                mark_failure(&lease.endpoint);
            } else {
                lease.endpoint.clear_failures();
            }
            Ok(decorate(resp, layer, started.elapsed(), lease))
        }
    }
}

fn mark_failure(endpoint: &crate::pool::Endpoint) {
    if endpoint.record_failure() {
        warn!(url = %endpoint.url, chain = %endpoint.chain, "endpoint marked unhealthy");
        metrics::set_upstream_health(&endpoint.chain, endpoint.layer, &endpoint.url, false);
    }
}

/// Turn the upstream response into the client response: copy status and
/// headers (minus hop-by-hop and framing), stream the body, and add the
/// gateway's own headers. The lease rides inside the body stream so the
/// in-flight slot is held until the last byte.
fn decorate(
    upstream: reqwest::Response,
    layer: Layer,
    elapsed: Duration,
    lease: crate::pool::Lease,
) -> Response {
    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            let lower = name.as_str().to_ascii_lowercase();
            if HOP_BY_HOP.contains(&lower.as_str()) || lower == "content-length" {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers.insert(
            HeaderName::from_static("x-rpc-gateway"),
            HeaderValue::from_static(GATEWAY_TAG),
        );
        headers.insert(
            HeaderName::from_static("x-endpoint-type"),
            HeaderValue::from_static(layer.as_str()),
        );
        if let Ok(v) = HeaderValue::from_str(&format!("{:.6}", elapsed.as_secs_f64())) {
            headers.insert(HeaderName::from_static("x-response-time"), v);
        }
    }
    let stream = upstream.bytes_stream().map(move |chunk| {
        let _hold = &lease;
        chunk
    });
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| {
            (
                StatusCode::BAD_GATEWAY,
                "upstream response could not be relayed",
            )
                .into_response()
        })
}
