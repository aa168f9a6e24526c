//! Type definitions for basket management.
//!
//! This module contains the configuration, response and page types shared by
//! every storage driver, plus the error surface of the store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Header multimap: name to ordered list of values.
///
/// Header names are kept verbatim as captured; lookups that need to be
/// case-insensitive normalize at the call site.
pub type Headers = HashMap<String, Vec<String>>;

// ============================================================================
// Basket configuration
// ============================================================================

/// Per-basket configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasketConfig {
    /// Absolute URL to forward ingested requests to; empty disables forwarding
    #[serde(default)]
    pub forward_url: String,
    /// Replace the configured response with the upstream response
    #[serde(default)]
    pub proxy_response: bool,
    /// Disable certificate validation when forwarding for this basket
    #[serde(default)]
    pub insecure_tls: bool,
    /// Append the trailing request path (beyond `/<basket>`) to the forward URL
    #[serde(default)]
    pub expand_path: bool,
    /// Ring capacity; bounded by the service-wide ceiling
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    200
}

impl Default for BasketConfig {
    fn default() -> Self {
        Self {
            forward_url: String::new(),
            proxy_response: false,
            insecure_tls: false,
            expand_path: false,
            capacity: default_capacity(),
        }
    }
}

impl BasketConfig {
    /// Validate against the service-wide capacity ceiling.
    ///
    /// Rejects a capacity outside `1..=hard_max` and a non-empty
    /// `forward_url` that is not an absolute URI.
    pub fn validate(&self, hard_max: usize) -> Result<(), StoreError> {
        if self.capacity < 1 {
            return Err(StoreError::InvalidConfig(
                "capacity must be at least 1".to_string(),
            ));
        }
        if self.capacity > hard_max {
            return Err(StoreError::InvalidConfig(format!(
                "capacity {} exceeds the service limit of {}",
                self.capacity, hard_max
            )));
        }
        if !self.forward_url.is_empty() {
            match Url::parse(&self.forward_url) {
                Ok(url) if url.has_host() => {}
                _ => {
                    return Err(StoreError::InvalidConfig(format!(
                        "forward_url is not an absolute URL: {}",
                        self.forward_url
                    )))
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Response configuration
// ============================================================================

/// Response generated by the service for requests collected by a basket.
///
/// Keyed by uppercase HTTP method in the basket's response map; the empty
/// method name is the wildcard entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseConfig {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: String,
    /// Interpret `body` as a template over the captured request
    #[serde(default)]
    pub is_template: bool,
    /// Interpret `body` as a script; wins over `is_template`
    #[serde(default)]
    pub is_script: bool,
}

fn default_status() -> u16 {
    200
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            status: default_status(),
            headers: Headers::new(),
            body: String::new(),
            is_template: false,
            is_script: false,
        }
    }
}

impl ResponseConfig {
    /// Validate the configured status code.
    pub fn validate(&self) -> Result<(), StoreError> {
        if !(100..=599).contains(&self.status) {
            return Err(StoreError::InvalidStatus(self.status));
        }
        Ok(())
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Basket credential returned exactly once, at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasketAuth {
    pub token: String,
}

// ============================================================================
// Pages
// ============================================================================

/// A page of collected requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestsPage {
    pub requests: Vec<super::record::RequestRecord>,
    /// Current ring size
    pub count: usize,
    /// Requests ever accepted, unaffected by eviction or clear
    pub total_count: u64,
    pub has_more: bool,
}

/// A page of requests found by a search filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestsQueryPage {
    pub requests: Vec<super::record::RequestRecord>,
    pub has_more: bool,
}

/// A page of basket names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasketNamesPage {
    pub names: Vec<String>,
    /// Total number of baskets in the store
    pub count: usize,
    pub has_more: bool,
}

/// A page of basket names found by a search filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasketNamesQueryPage {
    pub names: Vec<String>,
    pub has_more: bool,
}

// ============================================================================
// Search scope
// ============================================================================

/// Where a request search looks for the query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Body,
    Query,
    Headers,
    All,
}

impl SearchScope {
    /// Parse the scope parameter; anything unrecognized (including the empty
    /// string) searches everywhere.
    pub fn from_param(value: &str) -> Self {
        match value {
            "body" => SearchScope::Body,
            "query" => SearchScope::Query,
            "headers" => SearchScope::Headers,
            _ => SearchScope::All,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error surface of basket stores and baskets.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid basket name: {0}")]
    NameInvalid(String),
    #[error("basket name is reserved: {0}")]
    NameReserved(String),
    #[error("basket already exists: {0}")]
    NameConflict(String),
    #[error("invalid basket configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid response status: {0}")]
    InvalidStatus(u16),
    #[error("store is closed")]
    Closed,
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = BasketConfig::default();
        assert_eq!(config.capacity, 200);
        assert!(config.forward_url.is_empty());
        assert!(!config.proxy_response);
        assert!(!config.insecure_tls);
        assert!(!config.expand_path);
    }

    #[test]
    fn test_config_validate_capacity() {
        let mut config = BasketConfig::default();
        config.capacity = 0;
        assert!(matches!(
            config.validate(2000),
            Err(StoreError::InvalidConfig(_))
        ));

        config.capacity = 2001;
        assert!(matches!(
            config.validate(2000),
            Err(StoreError::InvalidConfig(_))
        ));

        config.capacity = 2000;
        assert!(config.validate(2000).is_ok());
    }

    #[test]
    fn test_config_validate_forward_url() {
        let mut config = BasketConfig::default();
        config.forward_url = "http://example.com/sink".to_string();
        assert!(config.validate(2000).is_ok());

        config.forward_url = "not a url".to_string();
        assert!(matches!(
            config.validate(2000),
            Err(StoreError::InvalidConfig(_))
        ));

        // Relative URLs are rejected
        config.forward_url = "/relative/path".to_string();
        assert!(config.validate(2000).is_err());

        config.forward_url = String::new();
        assert!(config.validate(2000).is_ok());
    }

    #[test]
    fn test_response_validate_status() {
        let mut response = ResponseConfig::default();
        assert_eq!(response.status, 200);
        assert!(response.validate().is_ok());

        response.status = 99;
        assert!(matches!(
            response.validate(),
            Err(StoreError::InvalidStatus(99))
        ));

        response.status = 600;
        assert!(response.validate().is_err());

        response.status = 599;
        assert!(response.validate().is_ok());
    }

    #[test]
    fn test_search_scope_parsing() {
        assert_eq!(SearchScope::from_param("body"), SearchScope::Body);
        assert_eq!(SearchScope::from_param("query"), SearchScope::Query);
        assert_eq!(SearchScope::from_param("headers"), SearchScope::Headers);
        assert_eq!(SearchScope::from_param(""), SearchScope::All);
        assert_eq!(SearchScope::from_param("anything"), SearchScope::All);
    }

    #[test]
    fn test_config_round_trip() {
        let config = BasketConfig {
            forward_url: "https://up.example.com/x".to_string(),
            proxy_response: true,
            insecure_tls: false,
            expand_path: true,
            capacity: 50,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: BasketConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_response_deserialize_defaults() {
        let response: ResponseConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(response.status, 200);
        assert!(response.body.is_empty());
        assert!(!response.is_template);
        assert!(!response.is_script);
    }
}
