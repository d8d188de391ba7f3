//! Chain registry — chain name → backend URL lists.
//!
//! The map is read on every dispatch, so readers clone an `Arc` snapshot
//! and never block; reload builds a fresh map and swaps the pointer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use gateway_config::ChainEndpoints;

pub struct ChainRegistry {
    map: RwLock<Arc<HashMap<String, ChainEndpoints>>>,
}

impl ChainRegistry {
    pub fn new(chains: HashMap<String, ChainEndpoints>) -> Self {
        Self {
            map: RwLock::new(Arc::new(chains)),
        }
    }

    /// O(1); `None` means "unknown chain".
    pub fn get(&self, chain: &str) -> Option<ChainEndpoints> {
        self.snapshot().get(&chain.to_lowercase()).cloned()
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, ChainEndpoints>> {
        Arc::clone(&self.map.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn chain_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whole-map swap; in-flight readers keep their old snapshot.
    pub fn reload(&self, chains: HashMap<String, ChainEndpoints>) {
        *self.map.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(chains);
    }
}
