//! In-process document store.
//!
//! One `RwLock` guards all collections; the write lock is the atomic
//! read-modify-write unit the data plane relies on. `touch_and_count`
//! performs the midnight reset and both counter increments inside a
//! single critical section, so concurrent requests for the same key
//! observe strictly increasing `daily_requests`.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use crate::model::{
    App, AppPatch, Chain, ChainPatch, DefaultAppSettings, NewApp, User, UserPatch,
};
use crate::{Result, StoreError};

/// Outcome of the atomic lookup-and-increment on an API key.
#[derive(Debug, Clone, PartialEq)]
pub enum TouchOutcome {
    /// Counters were incremented; holds the post-increment app.
    Counted(App),
    /// No app holds this key.
    InvalidKey,
    /// The key exists but the app is deactivated.
    Inactive,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    apps: HashMap<String, App>,
    /// api_key → app id
    api_keys: HashMap<String, String>,
    /// chain_id → chain
    chains: HashMap<u64, Chain>,
    defaults: DefaultAppSettings,
}

pub struct MemStore {
    inner: RwLock<Inner>,
}

impl MemStore {
    pub fn new(defaults: DefaultAppSettings) -> Self {
        Self {
            inner: RwLock::new(Inner {
                defaults,
                ..Default::default()
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("poisoned lock".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("poisoned lock".into()))
    }

    pub async fn ping(&self) -> Result<()> {
        self.read().map(|_| ())
    }

    // ── Users ────────────────────────────────────────────────────────

    /// The empty-store check and the insert share one lock acquisition,
    /// so exactly one account can ever observe the store empty and
    /// become the bootstrap admin.
    pub async fn create_user(&self, email: &str, password_hash: &str) -> Result<User> {
        let email = email.trim().to_lowercase();
        let mut inner = self.write()?;
        if inner.users.values().any(|u| u.email == email) {
            return Err(StoreError::Duplicate("email"));
        }
        let is_admin = inner.users.is_empty();
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4().to_string(),
            email,
            password_hash: password_hash.to_string(),
            is_active: true,
            is_admin,
            created_at: now,
            updated_at: now,
        };
        inner.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    pub async fn user(&self, id: &str) -> Result<Option<User>> {
        Ok(self.read()?.users.get(id).cloned())
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = email.trim().to_lowercase();
        Ok(self
            .read()?
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    pub async fn update_user(&self, id: &str, patch: UserPatch) -> Result<User> {
        let mut inner = self.write()?;
        let user = inner
            .users
            .get_mut(id)
            .ok_or(StoreError::NotFound("user"))?;
        if let Some(v) = patch.is_active {
            user.is_active = v;
        }
        if let Some(v) = patch.is_admin {
            user.is_admin = v;
        }
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    // ── Chains ───────────────────────────────────────────────────────

    pub async fn create_chain(&self, chain: Chain) -> Result<Chain> {
        let mut chain = chain;
        chain.chain_name = chain.chain_name.trim().to_lowercase();
        let mut inner = self.write()?;
        if inner.chains.contains_key(&chain.chain_id) {
            return Err(StoreError::Duplicate("chain_id"));
        }
        if inner
            .chains
            .values()
            .any(|c| c.chain_name == chain.chain_name)
        {
            return Err(StoreError::Duplicate("chain_name"));
        }
        inner.chains.insert(chain.chain_id, chain.clone());
        Ok(chain)
    }

    pub async fn chains(&self) -> Result<Vec<Chain>> {
        let mut out: Vec<Chain> = self.read()?.chains.values().cloned().collect();
        out.sort_by_key(|c| c.chain_id);
        Ok(out)
    }

    pub async fn chain_by_name(&self, name: &str) -> Result<Option<Chain>> {
        let name = name.to_lowercase();
        Ok(self
            .read()?
            .chains
            .values()
            .find(|c| c.chain_name == name)
            .cloned())
    }

    pub async fn update_chain(&self, chain_id: u64, patch: ChainPatch) -> Result<Chain> {
        let mut inner = self.write()?;
        let chain = inner
            .chains
            .get_mut(&chain_id)
            .ok_or(StoreError::NotFound("chain"))?;
        if let Some(v) = patch.description {
            chain.description = v;
        }
        if let Some(v) = patch.is_enabled {
            chain.is_enabled = v;
        }
        Ok(chain.clone())
    }

    pub async fn delete_chain(&self, chain_id: u64) -> Result<()> {
        let mut inner = self.write()?;
        inner
            .chains
            .remove(&chain_id)
            .map(|_| ())
            .ok_or(StoreError::NotFound("chain"))
    }

    /// Seed a chain document for a configured chain that has none yet.
    /// Assigns the lowest free chain id.
    pub async fn ensure_chain(&self, name: &str) -> Result<Chain> {
        let name = name.to_lowercase();
        let mut inner = self.write()?;
        if let Some(existing) = inner.chains.values().find(|c| c.chain_name == name) {
            return Ok(existing.clone());
        }
        let mut id = 1u64;
        while inner.chains.contains_key(&id) {
            id += 1;
        }
        let chain = Chain {
            chain_name: name,
            chain_id: id,
            description: String::new(),
            is_enabled: true,
        };
        inner.chains.insert(id, chain.clone());
        Ok(chain)
    }

    // ── Apps ─────────────────────────────────────────────────────────

    pub async fn create_app(&self, new: NewApp) -> Result<App> {
        let mut inner = self.write()?;
        let now = Utc::now();
        let app = App {
            id: Uuid::new_v4().to_string(),
            owner_user_id: new.owner_user_id,
            name: new.name,
            description: new.description,
            chain_name: new.chain_name.to_lowercase(),
            chain_id: new.chain_id,
            api_key: Uuid::new_v4().to_string(),
            max_rps: new.max_rps,
            daily_requests_limit: new.daily_requests_limit,
            is_active: true,
            requests: 0,
            daily_requests: 0,
            last_reset_date: now.date_naive(),
            created_at: now,
            updated_at: now,
        };
        inner.api_keys.insert(app.api_key.clone(), app.id.clone());
        inner.apps.insert(app.id.clone(), app.clone());
        Ok(app)
    }

    pub async fn app(&self, id: &str) -> Result<Option<App>> {
        Ok(self.read()?.apps.get(id).cloned())
    }

    pub async fn app_by_key(&self, api_key: &str) -> Result<Option<App>> {
        let inner = self.read()?;
        Ok(inner
            .api_keys
            .get(api_key)
            .and_then(|id| inner.apps.get(id))
            .cloned())
    }

    pub async fn apps_by_owner(&self, owner_user_id: &str) -> Result<Vec<App>> {
        let mut out: Vec<App> = self
            .read()?
            .apps
            .values()
            .filter(|a| a.owner_user_id == owner_user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    pub async fn update_app(&self, id: &str, patch: AppPatch) -> Result<App> {
        let mut inner = self.write()?;
        let app = inner.apps.get_mut(id).ok_or(StoreError::NotFound("app"))?;
        if let Some(v) = patch.name {
            app.name = v;
        }
        if let Some(v) = patch.description {
            app.description = v;
        }
        if let Some(v) = patch.is_active {
            app.is_active = v;
        }
        if let Some(v) = patch.max_rps {
            app.max_rps = v;
        }
        if let Some(v) = patch.daily_requests_limit {
            app.daily_requests_limit = v;
        }
        app.updated_at = Utc::now();
        Ok(app.clone())
    }

    pub async fn delete_app(&self, id: &str) -> Result<()> {
        let mut inner = self.write()?;
        let app = inner.apps.remove(id).ok_or(StoreError::NotFound("app"))?;
        inner.api_keys.remove(&app.api_key);
        Ok(())
    }

    /// Assign a fresh key; the old key stops resolving immediately.
    pub async fn regenerate_api_key(&self, id: &str) -> Result<String> {
        let mut inner = self.write()?;
        let new_key = Uuid::new_v4().to_string();
        let app = inner.apps.get_mut(id).ok_or(StoreError::NotFound("app"))?;
        let old_key = std::mem::replace(&mut app.api_key, new_key.clone());
        app.updated_at = Utc::now();
        inner.api_keys.remove(&old_key);
        inner.api_keys.insert(new_key.clone(), id.to_string());
        Ok(new_key)
    }

    /// Atomic lookup-and-increment: resolve the key, reset the daily
    /// counter if `last_reset_date` is not `today`, then increment both
    /// counters. The returned app carries the post-increment values.
    pub async fn touch_and_count(&self, api_key: &str, today: NaiveDate) -> Result<TouchOutcome> {
        let mut inner = self.write()?;
        let Some(app_id) = inner.api_keys.get(api_key).cloned() else {
            return Ok(TouchOutcome::InvalidKey);
        };
        let app = inner
            .apps
            .get_mut(&app_id)
            .ok_or(StoreError::NotFound("app"))?;
        if !app.is_active {
            return Ok(TouchOutcome::Inactive);
        }
        if app.last_reset_date != today {
            app.daily_requests = 0;
            app.last_reset_date = today;
        }
        app.daily_requests += 1;
        app.requests += 1;
        Ok(TouchOutcome::Counted(app.clone()))
    }

    /// Compensation for a request admitted by the increment but rejected
    /// by the post-increment quota check. The lifetime counter stays.
    pub async fn decrement_daily(&self, id: &str) -> Result<()> {
        let mut inner = self.write()?;
        let app = inner.apps.get_mut(id).ok_or(StoreError::NotFound("app"))?;
        app.daily_requests = app.daily_requests.saturating_sub(1);
        Ok(())
    }

    // ── Defaults ─────────────────────────────────────────────────────

    pub async fn default_app_settings(&self) -> Result<DefaultAppSettings> {
        Ok(self.read()?.defaults)
    }

    pub async fn update_default_app_settings(
        &self,
        max_rps: Option<u32>,
        daily_requests_limit: Option<u64>,
    ) -> Result<DefaultAppSettings> {
        let mut inner = self.write()?;
        if let Some(v) = max_rps {
            inner.defaults.default_max_rps = v;
        }
        if let Some(v) = daily_requests_limit {
            inner.defaults.default_daily_requests_limit = v;
        }
        Ok(inner.defaults)
    }
}
