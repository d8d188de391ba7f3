//! Unified API error type — every 4xx/5xx response is JSON with a
//! consistent shape.
//!
//! ```json
//! { "code": "rate_limited_rps", "message": "...", "correlation_id": "..." }
//! ```
//!
//! Components return `GateError`; the dispatcher and the CRUD surfaces
//! own nothing beyond picking the right constructor.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration as ChronoDuration, Utc};
use gateway_store::StoreError;
use serde_json::{json, Map, Value};

#[derive(Debug)]
pub struct GateError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub correlation_id: Option<String>,
    /// Extra fields merged into the JSON body (e.g. the 502 failover
    /// detail).
    pub detail: Option<Value>,
    /// Extra headers to include (e.g. Retry-After).
    pub extra_headers: Vec<(String, String)>,
}

impl GateError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            correlation_id: None,
            detail: None,
            extra_headers: vec![],
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    // ── Data-plane kinds ─────────────────────────────────────────────

    pub fn missing_api_key() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "missing_api_key",
            "request path must include an API key segment",
        )
    }

    pub fn invalid_key() -> Self {
        Self::new(StatusCode::FORBIDDEN, "invalid_key", "unknown API key")
    }

    pub fn inactive_app() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "inactive_app",
            "the app owning this key is deactivated",
        )
    }

    pub fn unknown_chain(chain: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "unknown_chain",
            format!("no chain named '{chain}' is configured"),
        )
    }

    pub fn chain_disabled(chain: &str) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "chain_disabled",
            format!("chain '{chain}' is not routable"),
        )
    }

    pub fn rate_limited_rps() -> Self {
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited_rps",
            "per-second rate limit exceeded",
        );
        err.extra_headers.push(("retry-after".into(), "1".into()));
        err
    }

    pub fn rate_limited_daily() -> Self {
        let now = Utc::now();
        let midnight = (now + ChronoDuration::days(1))
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .unwrap_or(now);
        let retry_after = (midnight - now).num_seconds().max(1);
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited_daily",
            "daily request quota exhausted",
        );
        err.extra_headers
            .push(("retry-after".into(), retry_after.to_string()));
        err
    }

    pub fn no_healthy_upstream(chain: &str, layer: &str, attempted: Vec<String>) -> Self {
        let mut err = Self::new(
            StatusCode::BAD_GATEWAY,
            "no_healthy_upstream",
            format!("all upstreams failed for {chain}/{layer}"),
        );
        err.detail = Some(json!({
            "chain": chain,
            "layer": layer,
            "attempted": attempted,
        }));
        err
    }

    pub fn upstream_timeout(chain: &str, layer: &str, url: &str) -> Self {
        let mut err = Self::new(
            StatusCode::GATEWAY_TIMEOUT,
            "upstream_timeout",
            format!("upstream did not answer in time for {chain}/{layer}"),
        );
        err.detail = Some(json!({ "chain": chain, "layer": layer, "url": url }));
        err
    }

    pub fn upstream_saturated(chain: &str, layer: &str) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "upstream_saturated",
            format!("all upstreams for {chain}/{layer} are at their in-flight cap"),
        )
    }

    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
    }

    // ── Control-plane kinds ──────────────────────────────────────────

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", msg)
    }

    pub fn not_found(resource: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("{resource} not found"),
        )
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", msg)
    }
}

impl From<StoreError> for GateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => GateError::not_found(what),
            StoreError::Duplicate(what) => GateError::conflict(format!("duplicate {what}")),
            StoreError::Unavailable(msg) => GateError::store_unavailable(msg),
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let mut body = Map::new();
        body.insert("code".into(), json!(self.code));
        body.insert("message".into(), json!(self.message));
        if let Some(id) = &self.correlation_id {
            body.insert("correlation_id".into(), json!(id));
        }
        if let Some(Value::Object(extra)) = self.detail {
            for (k, v) in extra {
                body.insert(k, v);
            }
        }
        let mut resp = (self.status, Json(Value::Object(body))).into_response();
        resp.headers_mut()
            .insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        for (k, v) in &self.extra_headers {
            if let (Ok(name), Ok(val)) = (
                k.parse::<axum::http::HeaderName>(),
                v.parse::<axum::http::HeaderValue>(),
            ) {
                resp.headers_mut().insert(name, val);
            }
        }
        resp
    }
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.status.as_u16(),
            self.code,
            self.message
        )
    }
}

impl std::error::Error for GateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_the_error_table() {
        assert_eq!(GateError::missing_api_key().status, StatusCode::BAD_REQUEST);
        assert_eq!(GateError::invalid_key().status, StatusCode::FORBIDDEN);
        assert_eq!(GateError::inactive_app().status, StatusCode::FORBIDDEN);
        assert_eq!(GateError::unknown_chain("x").status, StatusCode::NOT_FOUND);
        assert_eq!(
            GateError::chain_disabled("x").status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GateError::rate_limited_rps().status,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GateError::rate_limited_daily().status,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GateError::no_healthy_upstream("x", "execution", vec![]).status,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GateError::upstream_timeout("x", "execution", "u").status,
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GateError::upstream_saturated("x", "execution").status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GateError::store_unavailable("down").status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GateError::internal("boom").status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn failover_detail_is_flattened_into_the_body() {
        let err = GateError::no_healthy_upstream(
            "ethereum",
            "execution",
            vec!["http://a:8545".into(), "http://b:8545".into()],
        );
        let detail = err.detail.clone().unwrap();
        assert_eq!(detail["chain"], "ethereum");
        assert_eq!(detail["attempted"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn daily_retry_after_counts_to_utc_midnight() {
        let err = GateError::rate_limited_daily();
        let (_, v) = err
            .extra_headers
            .iter()
            .find(|(k, _)| k == "retry-after")
            .unwrap();
        let secs: i64 = v.parse().unwrap();
        assert!(secs >= 1 && secs <= 86_400);
    }

    #[test]
    fn store_errors_map_onto_http() {
        let e: GateError = StoreError::Unavailable("down".into()).into();
        assert_eq!(e.code, "store_unavailable");
        let e: GateError = StoreError::NotFound("app").into();
        assert_eq!(e.status, StatusCode::NOT_FOUND);
        let e: GateError = StoreError::Duplicate("email").into();
        assert_eq!(e.status, StatusCode::CONFLICT);
    }
}
