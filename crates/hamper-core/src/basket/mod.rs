//! Request basket management.
//!
//! This module provides:
//! - `Basket`: the per-basket contract (bounded request ring, response map,
//!   token auth, search)
//! - `MemoryBasket`: the in-memory ring every volatile driver builds on
//! - `RequestRecord`: captured request data with search and forwarding
//!
//! ## Module Structure
//!
//! - `types`: configuration, response and page types, errors
//! - `record`: request capture, search predicate and forwarding
//! - `core`: the basket trait and the in-memory implementation

pub mod core;
pub mod record;
pub mod types;


// Re-export the basket contract and the common types
pub use core::{Basket, MemoryBasket};
pub use record::{
    ForwardClient, ForwardError, ForwardedResponse, RequestRecord, DO_NOT_FORWARD_HEADER,
};
pub use types::{
    BasketAuth, BasketConfig, BasketNamesPage, BasketNamesQueryPage, Headers, RequestsPage,
    RequestsQueryPage, ResponseConfig, SearchScope, StoreError,
};
