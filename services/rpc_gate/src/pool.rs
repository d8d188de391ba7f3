//! Upstream pools — per (chain, layer) endpoint sets with health state,
//! in-flight accounting and selection.
//!
//! Selection is round-robin over the currently healthy subset, ties
//! broken by least in-flight. With no healthy endpoint the pool hands
//! out the least-recently-failed one and flags the dispatch as
//! degraded. Reads are lock-free; all endpoint state lives in atomics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use gateway_config::ChainEndpoints;

/// Consecutive failures before an endpoint flips to unhealthy.
pub const UNHEALTHY_THRESHOLD: u32 = 2;
/// Per-endpoint in-flight cap.
pub const IN_FLIGHT_CAP: u32 = 256;
/// How long a dispatch may wait for in-flight slack before failing.
pub const SATURATION_WAIT: Duration = Duration::from_millis(500);
const SATURATION_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    Execution,
    Consensus,
}

impl Layer {
    /// Parse the URL segment (`exec` / `cons`).
    pub fn from_segment(s: &str) -> Option<Self> {
        match s {
            "exec" => Some(Self::Execution),
            "cons" => Some(Self::Consensus),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Consensus => "consensus",
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One backend node URL within a chain/layer pool. Never persisted.
pub struct Endpoint {
    pub url: String,
    pub chain: String,
    pub layer: Layer,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    in_flight: AtomicU32,
    last_probe_at_ms: AtomicU64,
    last_failure_at_ms: AtomicU64,
}

impl Endpoint {
    pub(crate) fn new(url: String, chain: String, layer: Layer) -> Self {
        Self {
            url,
            chain,
            layer,
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            last_probe_at_ms: AtomicU64::new(0),
            last_failure_at_ms: AtomicU64::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn last_failure_at_ms(&self) -> u64 {
        self.last_failure_at_ms.load(Ordering::Relaxed)
    }

    /// Probe success: clears the failure streak and restores health.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_probe_at_ms.store(now_ms(), Ordering::Relaxed);
        self.healthy.store(true, Ordering::Release);
    }

    /// A failure observed by the prober or by a failed forward. Returns
    /// true when this failure flipped the endpoint to unhealthy.
    pub fn record_failure(&self) -> bool {
        let streak = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_failure_at_ms.store(now_ms(), Ordering::Relaxed);
        self.last_probe_at_ms.store(now_ms(), Ordering::Relaxed);
        if streak >= UNHEALTHY_THRESHOLD {
            let was = self.healthy.swap(false, Ordering::Release);
            return was;
        }
        false
    }

    /// A successful forward clears the failure streak; only the prober
    /// restores the healthy bit.
    pub fn clear_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn try_acquire(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::Relaxed);
        loop {
            if current >= IN_FLIGHT_CAP {
                return false;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Holds an in-flight slot on an endpoint until dropped.
pub struct Lease {
    pub endpoint: Arc<Endpoint>,
    /// True when the endpoint was handed out despite being unhealthy
    /// (optimistic probe with nothing better available).
    pub degraded: bool,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.endpoint.release();
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PoolError {
    /// No endpoints are configured for this (chain, layer).
    NoEndpoints,
    /// Every candidate sat at the in-flight cap for the whole wait.
    Saturated,
}

pub struct UpstreamPool {
    pools: HashMap<(String, Layer), Vec<Arc<Endpoint>>>,
    cursor: AtomicUsize,
}

impl UpstreamPool {
    pub fn from_chains<'a>(
        chains: impl IntoIterator<Item = (&'a String, &'a ChainEndpoints)>,
    ) -> Self {
        let mut pools: HashMap<(String, Layer), Vec<Arc<Endpoint>>> = HashMap::new();
        for (chain, entry) in chains {
            for (layer, urls) in [
                (Layer::Execution, &entry.execution),
                (Layer::Consensus, &entry.consensus),
            ] {
                let endpoints: Vec<Arc<Endpoint>> = urls
                    .iter()
                    .map(|u| Arc::new(Endpoint::new(u.clone(), chain.clone(), layer)))
                    .collect();
                if !endpoints.is_empty() {
                    pools.insert((chain.clone(), layer), endpoints);
                }
            }
        }
        Self {
            pools,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn endpoints(&self, chain: &str, layer: Layer) -> &[Arc<Endpoint>] {
        self.pools
            .get(&(chain.to_lowercase(), layer))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Every endpoint across every pool (prober wiring).
    pub fn all_endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.pools.values().flatten().cloned().collect()
    }

    /// One selection pass. `skip` excludes the endpoint a failed first
    /// attempt used.
    fn try_select(&self, chain: &str, layer: Layer, skip: Option<&str>) -> Option<Lease> {
        let pool = self.pools.get(&(chain.to_lowercase(), layer))?;
        let candidates: Vec<&Arc<Endpoint>> = pool
            .iter()
            .filter(|ep| skip != Some(ep.url.as_str()))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let rotation = self.cursor.fetch_add(1, Ordering::Relaxed);
        let healthy: Vec<&Arc<Endpoint>> = (0..candidates.len())
            .map(|i| candidates[(rotation + i) % candidates.len()])
            .filter(|ep| ep.is_healthy())
            .collect();

        if healthy.is_empty() {
            // Optimistic probe: least-recently-failed endpoint.
            let mut ordered: Vec<&Arc<Endpoint>> = candidates.clone();
            ordered.sort_by_key(|ep| ep.last_failure_at_ms());
            for ep in ordered {
                if ep.try_acquire() {
                    return Some(Lease {
                        endpoint: Arc::clone(ep),
                        degraded: true,
                    });
                }
            }
            return None;
        }

        // Stable sort keeps rotation order among equal in-flight counts,
        // which is what makes this round-robin.
        let mut ordered = healthy;
        ordered.sort_by_key(|ep| ep.in_flight());
        for ep in ordered {
            if ep.try_acquire() {
                return Some(Lease {
                    endpoint: Arc::clone(ep),
                    degraded: false,
                });
            }
        }
        None
    }

    /// Select an endpoint, waiting up to [`SATURATION_WAIT`] for an
    /// in-flight slot when every candidate is at the cap.
    pub async fn acquire(
        &self,
        chain: &str,
        layer: Layer,
        skip: Option<&str>,
    ) -> Result<Lease, PoolError> {
        let Some(pool) = self.pools.get(&(chain.to_lowercase(), layer)) else {
            return Err(PoolError::NoEndpoints);
        };
        if !pool.iter().any(|ep| skip != Some(ep.url.as_str())) {
            return Err(PoolError::NoEndpoints);
        }
        let deadline = tokio::time::Instant::now() + SATURATION_WAIT;
        loop {
            if let Some(lease) = self.try_select(chain, layer, skip) {
                return Ok(lease);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PoolError::Saturated);
            }
            tokio::time::sleep(SATURATION_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(chain: &str, urls: &[&str]) -> UpstreamPool {
        let entry = ChainEndpoints {
            execution: urls.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let chains = HashMap::from([(chain.to_string(), entry)]);
        UpstreamPool::from_chains(&chains)
    }

    #[tokio::test]
    async fn round_robin_cycles_over_healthy_endpoints() {
        let pool = pool_of("ethereum", &["http://a", "http://b", "http://c"]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let lease = pool.acquire("ethereum", Layer::Execution, None).await.unwrap();
            seen.push(lease.endpoint.url.clone());
        }
        seen.sort();
        assert_eq!(seen, vec!["http://a", "http://b", "http://c"]);
    }

    #[tokio::test]
    async fn unhealthy_endpoints_are_skipped() {
        let pool = pool_of("ethereum", &["http://a", "http://b"]);
        let bad = pool.endpoints("ethereum", Layer::Execution)[0].clone();
        bad.record_failure();
        bad.record_failure();
        assert!(!bad.is_healthy());
        for _ in 0..4 {
            let lease = pool.acquire("ethereum", Layer::Execution, None).await.unwrap();
            assert_ne!(lease.endpoint.url, bad.url);
            assert!(!lease.degraded);
        }
    }

    #[tokio::test]
    async fn all_unhealthy_hands_out_least_recently_failed() {
        let pool = pool_of("ethereum", &["http://a", "http://b"]);
        let eps = pool.endpoints("ethereum", Layer::Execution).to_vec();
        for ep in &eps {
            ep.record_failure();
            ep.record_failure();
        }
        // fail "b" again, later, so "a" is the least recently failed
        tokio::time::sleep(Duration::from_millis(5)).await;
        eps[1].record_failure();

        let lease = pool.acquire("ethereum", Layer::Execution, None).await.unwrap();
        assert!(lease.degraded);
        assert_eq!(lease.endpoint.url, "http://a");
    }

    #[tokio::test]
    async fn skip_excludes_the_failed_first_attempt() {
        let pool = pool_of("ethereum", &["http://a", "http://b"]);
        for _ in 0..4 {
            let lease = pool
                .acquire("ethereum", Layer::Execution, Some("http://a"))
                .await
                .unwrap();
            assert_eq!(lease.endpoint.url, "http://b");
        }
    }

    #[tokio::test]
    async fn ties_break_toward_least_in_flight() {
        let pool = pool_of("ethereum", &["http://a", "http://b"]);
        let busy = pool.endpoints("ethereum", Layer::Execution)[0].clone();
        let _held: Vec<bool> = (0..10).map(|_| busy.try_acquire()).collect();
        for _ in 0..4 {
            let lease = pool.acquire("ethereum", Layer::Execution, None).await.unwrap();
            assert_eq!(lease.endpoint.url, "http://b");
        }
    }

    #[tokio::test]
    async fn missing_pool_is_no_endpoints() {
        let pool = pool_of("ethereum", &["http://a"]);
        assert_eq!(
            pool.acquire("ethereum", Layer::Consensus, None)
                .await
                .err(),
            Some(PoolError::NoEndpoints)
        );
        assert_eq!(
            pool.acquire("solana", Layer::Execution, None).await.err(),
            Some(PoolError::NoEndpoints)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn saturation_times_out_when_no_slack_appears() {
        let pool = pool_of("ethereum", &["http://a"]);
        let ep = pool.endpoints("ethereum", Layer::Execution)[0].clone();
        while ep.try_acquire() {}
        assert_eq!(ep.in_flight(), IN_FLIGHT_CAP);
        let res = pool.acquire("ethereum", Layer::Execution, None).await;
        assert_eq!(res.err(), Some(PoolError::Saturated));
    }

    #[tokio::test]
    async fn lease_drop_releases_the_slot() {
        let pool = pool_of("ethereum", &["http://a"]);
        let ep = pool.endpoints("ethereum", Layer::Execution)[0].clone();
        {
            let _lease = pool.acquire("ethereum", Layer::Execution, None).await.unwrap();
            assert_eq!(ep.in_flight(), 1);
        }
        assert_eq!(ep.in_flight(), 0);
    }

    #[test]
    fn two_failures_flip_one_success_restores() {
        let ep = Endpoint::new("http://a".into(), "ethereum".into(), Layer::Execution);
        assert!(ep.is_healthy());
        assert!(!ep.record_failure());
        assert!(ep.is_healthy());
        assert!(ep.record_failure());
        assert!(!ep.is_healthy());
        ep.record_success();
        assert!(ep.is_healthy());
        assert_eq!(ep.consecutive_failures(), 0);
    }

    #[test]
    fn layer_segments() {
        assert_eq!(Layer::from_segment("exec"), Some(Layer::Execution));
        assert_eq!(Layer::from_segment("cons"), Some(Layer::Consensus));
        assert_eq!(Layer::from_segment("ws"), None);
        assert_eq!(Layer::Execution.as_str(), "execution");
    }
}
