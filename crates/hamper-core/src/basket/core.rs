//! The basket contract and the in-memory ring implementation.
//!
//! A basket owns a bounded, newest-first ring of captured requests, the
//! per-method response map, the basket configuration and the access token.
//! All mutation happens under one per-basket lock so that the ring, the
//! total counter and the configuration always agree at lock release.

use super::record::RequestRecord;
use super::types::{
    BasketConfig, RequestsPage, RequestsQueryPage, ResponseConfig, SearchScope, StoreError,
};
use crate::config::Limits;
use crate::metrics;
use crate::stats::BasketInfo;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// Basket trait
// ============================================================================

/// The basket contract every storage driver implements.
///
/// Listing operations observe either all or none of a concurrent `add`; the
/// linearization point is the release of the per-basket lock.
///
/// A basket handle outlives its store's `release()` only nominally: every
/// operation issued through it afterwards fails with
/// [`StoreError::Closed`].
pub trait Basket: Send + Sync {
    /// Current configuration
    fn config(&self) -> Result<BasketConfig, StoreError>;

    /// Replace the configuration.
    ///
    /// Shrinking the capacity below the current ring size drops the oldest
    /// entries immediately.
    fn update(&self, config: BasketConfig) -> Result<(), StoreError>;

    /// Compare a presented token against the basket credential
    fn authorize(&self, token: &str) -> Result<bool, StoreError>;

    /// Configured response for an (uppercase) method name, if any
    fn get_response(&self, method: &str) -> Result<Option<ResponseConfig>, StoreError>;

    /// Set the response for a method; the empty method is the wildcard
    fn set_response(&self, method: &str, response: ResponseConfig) -> Result<(), StoreError>;

    /// Append a captured request, evicting the oldest entry when full.
    /// Returns the stored record.
    fn add(&self, record: RequestRecord) -> Result<RequestRecord, StoreError>;

    /// Drop all collected requests; the total counter is unaffected
    fn clear(&self) -> Result<(), StoreError>;

    /// Current ring size
    fn size(&self) -> Result<usize, StoreError>;

    /// Page of collected requests, newest first
    fn get_requests(&self, max: usize, skip: usize) -> Result<RequestsPage, StoreError>;

    /// Page of requests matching the search criteria, newest first
    fn find_requests(
        &self,
        query: &str,
        scope: SearchScope,
        max: usize,
        skip: usize,
    ) -> Result<RequestsQueryPage, StoreError>;

    /// Snapshot for statistics aggregation
    fn info(&self) -> Result<BasketInfo, StoreError>;
}

/// Constant-time comparison to prevent timing attacks on token checks
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ============================================================================
// In-memory basket
// ============================================================================

/// Everything guarded by the per-basket lock.
struct BasketState {
    config: BasketConfig,
    responses: HashMap<String, ResponseConfig>,
    /// Newest first: index 0 is the latest accepted request
    requests: VecDeque<RequestRecord>,
    total_count: u64,
    last_request_date: i64,
}

/// Volatile basket backed by a `VecDeque` ring.
///
/// The `closed` flag is shared with the owning store: once the store is
/// released, every handle observes it and refuses further work.
pub struct MemoryBasket {
    name: String,
    token: String,
    limits: Limits,
    closed: Arc<AtomicBool>,
    state: RwLock<BasketState>,
}

impl MemoryBasket {
    pub fn new(
        name: String,
        token: String,
        config: BasketConfig,
        limits: Limits,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name,
            token,
            limits,
            closed,
            state: RwLock::new(BasketState {
                config,
                responses: HashMap::new(),
                requests: VecDeque::new(),
                total_count: 0,
                last_request_date: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Credential access for persistent drivers; never exposed through the
    /// basket contract.
    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    /// Restore counters and ring content, used by persistent drivers that
    /// keep a memory image (newest-first input order is preserved).
    pub(crate) fn restore(
        &self,
        responses: HashMap<String, ResponseConfig>,
        requests: Vec<RequestRecord>,
        total_count: u64,
    ) {
        let mut state = self.state.write();
        let capacity = state.config.capacity;
        state.responses = responses;
        state.last_request_date = requests.iter().map(|r| r.date).max().unwrap_or(0);
        state.requests = requests.into_iter().take(capacity).collect();
        state.total_count = total_count;
    }

    /// Serialize the guarded state for persistence.
    ///
    /// Deliberately not gated on the closed flag: the final flush during
    /// `release()` runs after the flag flips.
    pub(crate) fn snapshot(&self) -> (BasketConfig, HashMap<String, ResponseConfig>, Vec<RequestRecord>, u64) {
        let state = self.state.read();
        (
            state.config.clone(),
            state.responses.clone(),
            state.requests.iter().cloned().collect(),
            state.total_count,
        )
    }
}

impl Basket for MemoryBasket {
    fn config(&self) -> Result<BasketConfig, StoreError> {
        self.check_open()?;
        Ok(self.state.read().config.clone())
    }

    fn update(&self, config: BasketConfig) -> Result<(), StoreError> {
        self.check_open()?;
        config.validate(self.limits.max_capacity)?;
        let mut state = self.state.write();
        while state.requests.len() > config.capacity {
            state.requests.pop_back();
            metrics::record_eviction("shrink");
        }
        state.config = config;
        Ok(())
    }

    fn authorize(&self, token: &str) -> Result<bool, StoreError> {
        self.check_open()?;
        Ok(constant_time_eq(token.as_bytes(), self.token.as_bytes()))
    }

    fn get_response(&self, method: &str) -> Result<Option<ResponseConfig>, StoreError> {
        self.check_open()?;
        Ok(self.state.read().responses.get(method).cloned())
    }

    fn set_response(&self, method: &str, response: ResponseConfig) -> Result<(), StoreError> {
        self.check_open()?;
        response.validate()?;
        let mut state = self.state.write();
        state.responses.insert(method.to_uppercase(), response);
        Ok(())
    }

    fn add(&self, record: RequestRecord) -> Result<RequestRecord, StoreError> {
        self.check_open()?;
        let mut state = self.state.write();
        state.requests.push_front(record.clone());
        let capacity = state.config.capacity;
        while state.requests.len() > capacity {
            state.requests.pop_back();
            metrics::record_eviction("overflow");
        }
        state.total_count += 1;
        if record.date > state.last_request_date {
            state.last_request_date = record.date;
        }
        Ok(record)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.check_open()?;
        self.state.write().requests.clear();
        Ok(())
    }

    fn size(&self) -> Result<usize, StoreError> {
        self.check_open()?;
        Ok(self.state.read().requests.len())
    }

    fn get_requests(&self, max: usize, skip: usize) -> Result<RequestsPage, StoreError> {
        self.check_open()?;
        let max = max.min(self.limits.page_limit);
        let state = self.state.read();
        let count = state.requests.len();
        let requests: Vec<RequestRecord> = state
            .requests
            .iter()
            .skip(skip)
            .take(max)
            .cloned()
            .collect();
        let has_more = skip + requests.len() < count;
        Ok(RequestsPage {
            requests,
            count,
            total_count: state.total_count,
            has_more,
        })
    }

    fn find_requests(
        &self,
        query: &str,
        scope: SearchScope,
        max: usize,
        skip: usize,
    ) -> Result<RequestsQueryPage, StoreError> {
        self.check_open()?;
        let max = max.min(self.limits.page_limit);
        let state = self.state.read();
        let mut requests = Vec::new();
        let mut skipped = 0usize;
        let mut has_more = false;
        for record in state.requests.iter() {
            if !record.matches(query, scope) {
                continue;
            }
            if skipped < skip {
                skipped += 1;
                continue;
            }
            if requests.len() < max {
                requests.push(record.clone());
            } else {
                // one extra match beyond the page proves there is more
                has_more = true;
                break;
            }
        }
        Ok(RequestsQueryPage { requests, has_more })
    }

    fn info(&self) -> Result<BasketInfo, StoreError> {
        self.check_open()?;
        let state = self.state.read();
        Ok(BasketInfo {
            name: self.name.clone(),
            requests_count: state.requests.len(),
            requests_total_count: state.total_count,
            last_request_date: state.last_request_date,
        })
    }
}
