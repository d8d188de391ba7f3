//! Metrics service.
//!
//! Emits the gateway's own series through the `metrics` recorder and,
//! for the admin surface, scrapes the chain-level Prometheus endpoints
//! and fuses partial results.
//!
//! Series:
//! - `rpc_requests_total{chain, layer, method, api_key_hash, status}`
//! - `rpc_request_duration_seconds{chain, layer, method, api_key_hash}`
//! - `rate_limit_hits_total{kind, api_key_hash}`
//! - `upstream_health{chain, layer, url}` (0/1)

use std::collections::BTreeMap;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::pool::Layer;

/// Per-node scrape timeout.
pub const SCRAPE_TIMEOUT: Duration = Duration::from_secs(10);

/// The subset of upstream series the aggregator keeps.
pub const SCRAPED_SERIES: &[&str] = &[
    "go_goroutines",
    "go_threads",
    "go_memstats_alloc_bytes",
    "go_memstats_sys_bytes",
    "process_resident_memory_bytes",
    "process_cpu_seconds_total",
];

static RECORDER: std::sync::OnceLock<Option<metrics_exporter_prometheus::PrometheusHandle>> =
    std::sync::OnceLock::new();

/// Install the Prometheus recorder and return a handle for the
/// /metrics endpoint. Safe to call multiple times; every caller gets
/// the same process-wide handle.
pub fn install_recorder() -> Option<metrics_exporter_prometheus::PrometheusHandle> {
    RECORDER
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .ok()
        })
        .clone()
}

/// Stable, non-reversible label for an API key: the first 16 hex chars
/// of its SHA-256. Keeps secret material out of the exposition while
/// staying joinable across series.
pub fn api_key_hash(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    hex::encode(digest)[..16].to_string()
}

pub fn record_request(chain: &str, layer: Layer, method: &str, key_hash: &str, status: u16) {
    counter!(
        "rpc_requests_total",
        "chain" => chain.to_string(),
        "layer" => layer.as_str(),
        "method" => method.to_string(),
        "api_key_hash" => key_hash.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}

pub fn record_duration(chain: &str, layer: Layer, method: &str, key_hash: &str, secs: f64) {
    histogram!(
        "rpc_request_duration_seconds",
        "chain" => chain.to_string(),
        "layer" => layer.as_str(),
        "method" => method.to_string(),
        "api_key_hash" => key_hash.to_string(),
    )
    .record(secs);
}

#[derive(Debug, Clone, Copy)]
pub enum LimitKind {
    Rps,
    Daily,
}

impl LimitKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Rps => "rps",
            Self::Daily => "daily",
        }
    }
}

pub fn record_rate_limit_hit(kind: LimitKind, key_hash: &str) {
    counter!(
        "rate_limit_hits_total",
        "kind" => kind.as_str(),
        "api_key_hash" => key_hash.to_string(),
    )
    .increment(1);
}

pub fn set_upstream_health(chain: &str, layer: Layer, url: &str, healthy: bool) {
    gauge!(
        "upstream_health",
        "chain" => chain.to_string(),
        "layer" => layer.as_str(),
        "url" => url.to_string(),
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

// ── Chain-level scrape fan-out ───────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct NodeMetrics {
    pub node_index: usize,
    pub node_url: String,
    /// "available" | "unavailable"
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MetricsAggregate {
    pub status: &'static str,
    pub total_nodes: usize,
    pub available_nodes: usize,
    pub nodes: Vec<NodeMetrics>,
}

/// GET every Prometheus URL of a chain in parallel and merge the
/// partial results; a node failing never fails the aggregate.
pub async fn scrape_chain(client: &reqwest::Client, urls: &[String]) -> MetricsAggregate {
    let fetches = urls.iter().enumerate().map(|(i, url)| {
        let client = client.clone();
        let url = url.clone();
        async move {
            match client
                .get(url.as_str())
                .timeout(SCRAPE_TIMEOUT)
                .send()
                .await
                .and_then(|r| r.error_for_status())
            {
                Ok(resp) => match resp.text().await {
                    Ok(text) => NodeMetrics {
                        node_index: i,
                        node_url: url,
                        status: "available",
                        metrics: Some(parse_exposition(&text)),
                        error: None,
                    },
                    Err(e) => unavailable(i, url, e.to_string()),
                },
                Err(e) => unavailable(i, url, e.to_string()),
            }
        }
    });
    let nodes: Vec<NodeMetrics> = futures_util::future::join_all(fetches).await;
    let available_nodes = nodes.iter().filter(|n| n.status == "available").count();
    MetricsAggregate {
        status: if urls.is_empty() {
            "unconfigured"
        } else if available_nodes > 0 {
            "available"
        } else {
            "unavailable"
        },
        total_nodes: urls.len(),
        available_nodes,
        nodes,
    }
}

fn unavailable(node_index: usize, node_url: String, error: String) -> NodeMetrics {
    NodeMetrics {
        node_index,
        node_url,
        status: "unavailable",
        metrics: None,
        error: Some(error),
    }
}

/// Pull the [`SCRAPED_SERIES`] subset out of a Prometheus text
/// exposition. Labelled variants of the same series collapse onto the
/// bare name (last sample wins).
pub fn parse_exposition(text: &str) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let name_end = line
            .find(|c: char| c == '{' || c.is_whitespace())
            .unwrap_or(line.len());
        let name = &line[..name_end];
        if !SCRAPED_SERIES.contains(&name) {
            continue;
        }
        let Some(value_str) = line.rsplit(|c: char| c.is_whitespace()).next() else {
            continue;
        };
        if let Ok(value) = value_str.parse::<f64>() {
            out.insert(name.to_string(), value);
        }
    }
    out
}
