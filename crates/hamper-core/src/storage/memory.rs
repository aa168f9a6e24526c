//! Volatile basket storage.
//!
//! Baskets live in a locked map; nothing survives the process. The map lock
//! is only held for lookup, insert and remove, never across per-basket work.
//! The store's closed flag is shared with every basket it hands out, so
//! handles obtained before `release()` fail afterwards instead of mutating
//! a store that is gone.

use super::{filter_names, mint_token, paginate_names, validate_name, BasketStore};
use crate::basket::core::{Basket, MemoryBasket};
use crate::basket::types::{
    BasketAuth, BasketConfig, BasketNamesPage, BasketNamesQueryPage, StoreError,
};
use crate::config::ServiceConfig;
use crate::stats::DatabaseStats;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// In-memory basket store.
pub struct MemoryStore {
    config: ServiceConfig,
    baskets: RwLock<HashMap<String, Arc<MemoryBasket>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            baskets: RwLock::new(HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Lexicographically sorted snapshot of basket names.
    fn sorted_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.baskets.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl BasketStore for MemoryStore {
    fn create(&self, name: &str, config: BasketConfig) -> Result<BasketAuth, StoreError> {
        self.check_open()?;
        validate_name(name, &self.config.reserved_names)?;
        config.validate(self.config.max_capacity)?;

        let token = mint_token(self.config.token_length);
        let mut baskets = self.baskets.write();
        if baskets.contains_key(name) {
            return Err(StoreError::NameConflict(name.to_string()));
        }
        baskets.insert(
            name.to_string(),
            Arc::new(MemoryBasket::new(
                name.to_string(),
                token.clone(),
                config,
                self.config.limits(),
                Arc::clone(&self.closed),
            )),
        );
        info!("Created basket '{name}'");
        Ok(BasketAuth { token })
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Basket>> {
        if self.closed.load(Ordering::Acquire) {
            warn!("Lookup of basket '{name}' on a released store");
            return None;
        }
        let baskets = self.baskets.read();
        baskets.get(name).cloned().map(|b| b as Arc<dyn Basket>)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.check_open()?;
        if self.baskets.write().remove(name).is_some() {
            info!("Deleted basket '{name}'");
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.baskets.read().len()
    }

    fn get_names(&self, max: usize, skip: usize) -> BasketNamesPage {
        let max = max.min(self.config.limits().page_limit);
        let names = self.sorted_names();
        let count = names.len();
        let (page, has_more) = paginate_names(&names, max, skip);
        BasketNamesPage {
            names: page,
            count,
            has_more,
        }
    }

    fn find_names(&self, query: &str, max: usize, skip: usize) -> BasketNamesQueryPage {
        let max = max.min(self.config.limits().page_limit);
        let names = self.sorted_names();
        let (page, has_more) = filter_names(&names, query, max, skip);
        BasketNamesQueryPage {
            names: page,
            has_more,
        }
    }

    fn get_stats(&self, max: usize) -> DatabaseStats {
        let baskets: Vec<Arc<MemoryBasket>> = self.baskets.read().values().cloned().collect();
        let mut stats = DatabaseStats::default();
        for basket in baskets {
            if let Ok(info) = basket.info() {
                stats.collect(&info, max);
            }
        }
        stats.update_average();
        stats
    }

    fn release(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.baskets.write().clear();
        info!("Memory store released");
    }
}
