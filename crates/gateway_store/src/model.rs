//! Persistent documents: users, chains, apps and the default-settings
//! singleton.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A registered tenant account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named routing target. Only enabled chains are routable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    /// Canonical form is lowercase.
    pub chain_name: String,
    pub chain_id: u64,
    #[serde(default)]
    pub description: String,
    pub is_enabled: bool,
}

/// A tenant-owned routing principal holding an API key and per-chain
/// quota counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub owner_user_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub chain_name: String,
    pub chain_id: u64,
    pub api_key: String,
    /// Zero disables the RPS check.
    pub max_rps: u32,
    /// Zero disables the daily quota.
    pub daily_requests_limit: u64,
    pub is_active: bool,
    /// Lifetime counter, monotonic.
    pub requests: u64,
    /// Resets at UTC midnight; `last_reset_date` names the UTC day the
    /// counter currently reflects.
    pub daily_requests: u64,
    pub last_reset_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Singleton consumed when an app is created without explicit limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DefaultAppSettings {
    pub default_max_rps: u32,
    pub default_daily_requests_limit: u64,
}

impl Default for DefaultAppSettings {
    fn default() -> Self {
        Self {
            default_max_rps: 20,
            default_daily_requests_limit: 10_000,
        }
    }
}

/// Fields for `MemStore::create_app`; id, key and counters are assigned
/// by the store.
#[derive(Debug, Clone)]
pub struct NewApp {
    pub owner_user_id: String,
    pub name: String,
    pub description: String,
    pub chain_name: String,
    pub chain_id: u64,
    pub max_rps: u32,
    pub daily_requests_limit: u64,
}

/// Partial update for an app; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct AppPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
    pub max_rps: Option<u32>,
    pub daily_requests_limit: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub is_active: Option<bool>,
    pub is_admin: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ChainPatch {
    pub description: Option<String>,
    pub is_enabled: Option<bool>,
}
