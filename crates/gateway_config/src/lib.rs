//! Gateway configuration from the process environment.
//!
//! Chain backends are discovered by scanning the environment for
//! `<PREFIX>_EXECUTION_RPC_URL`, `<PREFIX>_CONSENSUS_API_URL` and
//! `<PREFIX>_PROMETHEUS_URL` variables; each holds a comma-separated
//! URL list and the lowercased prefix becomes the chain name.
//!
//! ```text
//! ETHEREUM_EXECUTION_RPC_URL=http://node-a:8545,http://node-b:8545
//! ETHEREUM_CONSENSUS_API_URL=http://beacon-a:5052
//! ETHEREUM_PROMETHEUS_URL=http://node-a:9090
//! ```

use std::collections::HashMap;
use thiserror::Error;

const EXECUTION_SUFFIX: &str = "_EXECUTION_RPC_URL";
const CONSENSUS_SUFFIX: &str = "_CONSENSUS_API_URL";
const PROMETHEUS_SUFFIX: &str = "_PROMETHEUS_URL";

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_RPS: u32 = 20;
pub const DEFAULT_DAILY_REQUESTS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("JWT_SECRET must be set (or INSECURE_DEV_SECRET=1 for local runs)")]
    MissingJwtSecret,

    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: String, value: String },
}

/// Backend URL lists for one chain, one entry per layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainEndpoints {
    pub execution: Vec<String>,
    pub consensus: Vec<String>,
    pub prometheus: Vec<String>,
}

impl ChainEndpoints {
    pub fn is_empty(&self) -> bool {
        self.execution.is_empty() && self.consensus.is_empty() && self.prometheus.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub jwt_secret: String,
    pub default_max_rps: u32,
    pub default_daily_requests: u64,
    pub enable_metrics: bool,
    /// chain name (lowercase) → endpoint lists
    pub chains: HashMap<String, ChainEndpoints>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Build a config from an explicit variable set. `from_env` delegates
    /// here; tests pass their own pairs instead of mutating the process
    /// environment.
    pub fn from_vars(
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = vars.into_iter().collect();

        let port = parse_or(&vars, "PORT", DEFAULT_PORT)?;
        let default_max_rps = parse_or(&vars, "DEFAULT_MAX_RPS", DEFAULT_MAX_RPS)?;
        let default_daily_requests =
            parse_or(&vars, "DEFAULT_DAILY_REQUESTS", DEFAULT_DAILY_REQUESTS)?;
        let enable_metrics = parse_bool_or(&vars, "ENABLE_METRICS", true)?;

        let jwt_secret = match vars.get("JWT_SECRET").filter(|s| !s.is_empty()) {
            Some(s) => s.clone(),
            None if parse_bool_or(&vars, "INSECURE_DEV_SECRET", false)? => {
                "rpc-gate-dev-secret".to_string()
            }
            None => return Err(ConfigError::MissingJwtSecret),
        };

        let mut chains: HashMap<String, ChainEndpoints> = HashMap::new();
        for (key, value) in &vars {
            let (prefix, slot) = if let Some(p) = key.strip_suffix(EXECUTION_SUFFIX) {
                (p, Slot::Execution)
            } else if let Some(p) = key.strip_suffix(CONSENSUS_SUFFIX) {
                (p, Slot::Consensus)
            } else if let Some(p) = key.strip_suffix(PROMETHEUS_SUFFIX) {
                (p, Slot::Prometheus)
            } else {
                continue;
            };
            if prefix.is_empty() {
                continue;
            }
            let urls = split_urls(value);
            if urls.is_empty() {
                continue;
            }
            let entry = chains.entry(prefix.to_lowercase()).or_default();
            match slot {
                Slot::Execution => entry.execution = urls,
                Slot::Consensus => entry.consensus = urls,
                Slot::Prometheus => entry.prometheus = urls,
            }
        }

        Ok(Self {
            port,
            jwt_secret,
            default_max_rps,
            default_daily_requests,
            enable_metrics,
            chains,
        })
    }
}

enum Slot {
    Execution,
    Consensus,
    Prometheus,
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    var: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(var).filter(|s| !s.is_empty()) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            var: var.to_string(),
            value: raw.clone(),
        }),
        None => Ok(default),
    }
}

fn parse_bool_or(
    vars: &HashMap<String, String>,
    var: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(var).map(|s| s.as_str()) {
        None | Some("") => Ok(default),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            var: var.to_string(),
            value: other.to_string(),
        }),
    }
}
