//! Health prober — one interval task per endpoint.
//!
//! Execution endpoints answer a JSON-RPC `eth_blockNumber`; consensus
//! endpoints answer the beacon `/eth/v1/node/health` route. Health
//! flips are those of [`Endpoint`]: two consecutive failures down, one
//! success up.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metrics;
use crate::pool::{Endpoint, Layer, UpstreamPool};

pub const PROBE_INTERVAL: Duration = Duration::from_secs(15);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Prober {
    handles: Vec<JoinHandle<()>>,
}

impl Prober {
    /// Spawn a probe loop for every endpoint in the pool.
    pub fn spawn(pool: &UpstreamPool, interval: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("probe client");
        let handles = pool
            .all_endpoints()
            .into_iter()
            .map(|ep| tokio::spawn(probe_loop(client.clone(), ep, interval)))
            .collect();
        Self { handles }
    }

    pub fn shutdown(&self) {
        for h in &self.handles {
            h.abort();
        }
    }
}

async fn probe_loop(client: reqwest::Client, ep: Arc<Endpoint>, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let ok = probe_once(&client, &ep).await;
        if ok {
            ep.record_success();
        } else {
            let flipped = ep.record_failure();
            if flipped {
                warn!(url = %ep.url, chain = %ep.chain, layer = %ep.layer, "endpoint marked unhealthy");
            } else {
                debug!(url = %ep.url, "probe failed");
            }
        }
        metrics::set_upstream_health(&ep.chain, ep.layer, &ep.url, ep.is_healthy());
    }
}

/// One probe round-trip; true means healthy.
pub async fn probe_once(client: &reqwest::Client, ep: &Endpoint) -> bool {
    match ep.layer {
        Layer::Execution => {
            let body = json!({
                "jsonrpc": "2.0",
                "method": "eth_blockNumber",
                "params": [],
                "id": 1,
            });
            let resp = match client.post(ep.url.as_str()).json(&body).send().await {
                Ok(r) => r,
                Err(_) => return false,
            };
            if resp.status() != reqwest::StatusCode::OK {
                return false;
            }
            match resp.json::<Value>().await {
                Ok(v) => v.get("result").is_some(),
                Err(_) => false,
            }
        }
        Layer::Consensus => {
            let url = format!("{}/eth/v1/node/health", ep.url.trim_end_matches('/'));
            match client.get(url).send().await {
                Ok(r) => {
                    r.status() == reqwest::StatusCode::OK
                        || r.status() == reqwest::StatusCode::PARTIAL_CONTENT
                }
                Err(_) => false,
            }
        }
    }
}
