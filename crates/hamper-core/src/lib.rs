//! Hamper - an HTTP request basket engine.
//!
//! Baskets are ephemeral intake points for arbitrary HTTP requests: whatever
//! arrives is captured into a bounded newest-first ring for later
//! inspection, optionally relayed to a configured upstream, and answered
//! with a configured, templated or scripted response.
//!
//! The crate is the storage- and transport-agnostic core: the HTTP surface
//! that routes management calls and basket traffic lives elsewhere and
//! drives the [`pipeline::IngestPipeline`] plus a [`storage::BasketStore`]
//! driver (volatile, single-file or SQLite-backed).

pub mod basket;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod scripting;
pub mod stats;
pub mod storage;
pub mod template;

pub use basket::{Basket, BasketAuth, BasketConfig, RequestRecord, ResponseConfig, StoreError};
pub use config::ServiceConfig;
pub use pipeline::{IngestPipeline, IngestReply};
pub use storage::BasketStore;
