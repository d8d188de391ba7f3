//! Per-app token buckets for the RPS axis of rate limiting.
//!
//! Capacity and refill rate both equal the app's `max_rps`; zero
//! disables the check. Buckets live in a sharded map so hot keys only
//! contend with their own shard, and idle entries are swept lazily.
//! The daily-quota axis is enforced against the store by the
//! dispatcher; this module only does the in-memory float arithmetic.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const SHARDS: usize = 16;
/// Buckets untouched for this long are dropped on the next shard visit.
const IDLE_EVICT: Duration = Duration::from_secs(600);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_touch: Instant,
}

pub struct RateLimiter {
    shards: Vec<Mutex<HashMap<String, Bucket>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, api_key: &str) -> &Mutex<HashMap<String, Bucket>> {
        let mut hasher = DefaultHasher::new();
        api_key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Try to consume one token for the given key. `max_rps == 0`
    /// always admits.
    pub fn check(&self, api_key: &str, max_rps: u32) -> bool {
        if max_rps == 0 {
            return true;
        }
        let capacity = max_rps as f64;
        let now = Instant::now();
        let mut buckets = self.shard(api_key).lock().unwrap_or_else(|e| e.into_inner());

        buckets.retain(|_, b| now.duration_since(b.last_touch) < IDLE_EVICT);

        let bucket = buckets.entry(api_key.to_string()).or_insert_with(|| Bucket {
            tokens: capacity,
            last_refill: now,
            last_touch: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * capacity).min(capacity);
        bucket.last_refill = now;
        bucket.last_touch = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap().len())
            .sum()
    }
}
