//! Basket storage drivers.
//!
//! The [`BasketStore`] trait is the persistence seam of the engine: the same
//! observable semantics are provided by a volatile map
//! ([`memory::MemoryStore`]), a single-file JSON database
//! ([`file::FileStore`]) and an embedded SQL engine
//! ([`sqlite::SqliteStore`]).

mod file;
mod memory;
mod sqlite;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::basket::core::Basket;
use crate::basket::types::{
    BasketAuth, BasketConfig, BasketNamesPage, BasketNamesQueryPage, StoreError,
};
use crate::stats::DatabaseStats;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;

/// Named collection of baskets.
///
/// Store-level operations only lock long enough to look a basket handle up,
/// insert one or remove one; per-basket work happens under the basket's own
/// lock.
pub trait BasketStore: Send + Sync {
    /// Create a basket and mint its credential. The token is returned exactly
    /// once and is never readable afterwards.
    fn create(&self, name: &str, config: BasketConfig) -> Result<BasketAuth, StoreError>;

    /// Look a basket up by name
    fn get(&self, name: &str) -> Option<Arc<dyn Basket>>;

    /// Delete a basket and release its resources. Deleting an absent basket
    /// is a no-op.
    fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Number of baskets
    fn size(&self) -> usize;

    /// Page of basket names in lexicographic order
    fn get_names(&self, max: usize, skip: usize) -> BasketNamesPage;

    /// Page of basket names containing `query` as a substring, in the same
    /// stable order
    fn find_names(&self, query: &str, max: usize, skip: usize) -> BasketNamesQueryPage;

    /// Aggregate statistics with top lists bounded by `max`
    fn get_stats(&self, max: usize) -> DatabaseStats;

    /// Close backing resources; subsequent operations fail with
    /// [`StoreError::Closed`] (lookups turn empty).
    fn release(&self);
}

/// Basket name syntax: `[A-Za-z0-9_-]{1,250}`, case-sensitive.
static NAME_REGEX: OnceLock<Regex> = OnceLock::new();

fn name_regex() -> &'static Regex {
    NAME_REGEX.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,250}$").unwrap())
}

/// Validate a basket name against the syntax and the reserved set.
pub fn validate_name(name: &str, reserved: &[String]) -> Result<(), StoreError> {
    if !name_regex().is_match(name) {
        return Err(StoreError::NameInvalid(name.to_string()));
    }
    if reserved.iter().any(|r| r == name) {
        return Err(StoreError::NameReserved(name.to_string()));
    }
    Ok(())
}

/// Mint a high-entropy, URL-safe basket token.
pub fn mint_token(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Page a sorted name list: returns the page and the has-more flag.
pub(crate) fn paginate_names(names: &[String], max: usize, skip: usize) -> (Vec<String>, bool) {
    let page: Vec<String> = names.iter().skip(skip).take(max).cloned().collect();
    let has_more = skip + page.len() < names.len();
    (page, has_more)
}

/// Filter a sorted name list by substring and page the matches; the scan
/// looks one match past the page to report has-more truthfully.
pub(crate) fn filter_names(
    names: &[String],
    query: &str,
    max: usize,
    skip: usize,
) -> (Vec<String>, bool) {
    let mut page = Vec::new();
    let mut skipped = 0usize;
    let mut has_more = false;
    for name in names.iter().filter(|n| n.contains(query)) {
        if skipped < skip {
            skipped += 1;
            continue;
        }
        if page.len() < max {
            page.push(name.clone());
        } else {
            has_more = true;
            break;
        }
    }
    (page, has_more)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(validate_name("basket-1_A", &[]).is_ok());
        assert!(validate_name(&"x".repeat(250), &[]).is_ok());

        assert!(matches!(
            validate_name("", &[]),
            Err(StoreError::NameInvalid(_))
        ));
        assert!(matches!(
            validate_name(&"x".repeat(251), &[]),
            Err(StoreError::NameInvalid(_))
        ));
        assert!(matches!(
            validate_name("has space", &[]),
            Err(StoreError::NameInvalid(_))
        ));
        assert!(matches!(
            validate_name("dot.name", &[]),
            Err(StoreError::NameInvalid(_))
        ));
        assert!(matches!(
            validate_name("slash/name", &[]),
            Err(StoreError::NameInvalid(_))
        ));
    }

    #[test]
    fn test_reserved_names() {
        let reserved = vec!["api".to_string(), "metrics".to_string()];
        assert!(matches!(
            validate_name("api", &reserved),
            Err(StoreError::NameReserved(_))
        ));
        // case-sensitive: reserved set entries only match exactly
        assert!(validate_name("API", &reserved).is_ok());
        assert!(validate_name("other", &reserved).is_ok());
    }

    #[test]
    fn test_mint_token() {
        let token = mint_token(32);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));

        // astronomically unlikely to collide
        assert_ne!(mint_token(32), mint_token(32));
    }

    #[test]
    fn test_paginate_names() {
        let names: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let (page, has_more) = paginate_names(&names, 2, 0);
        assert_eq!(page, vec!["a", "b"]);
        assert!(has_more);

        let (page, has_more) = paginate_names(&names, 2, 2);
        assert_eq!(page, vec!["c", "d"]);
        assert!(!has_more);

        let (page, has_more) = paginate_names(&names, 2, 4);
        assert!(page.is_empty());
        assert!(!has_more);
    }

    #[test]
    fn test_filter_names() {
        let names: Vec<String> = ["alpha", "beta", "gamma-alpha", "delta"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (page, has_more) = filter_names(&names, "alpha", 1, 0);
        assert_eq!(page, vec!["alpha"]);
        assert!(has_more);

        let (page, has_more) = filter_names(&names, "alpha", 5, 1);
        assert_eq!(page, vec!["gamma-alpha"]);
        assert!(!has_more);
    }
}
