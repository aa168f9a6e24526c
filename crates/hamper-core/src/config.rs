//! Service-wide configuration for the basket engine.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Hard ceiling for any paged call, regardless of configuration.
pub const HARD_PAGE_LIMIT: usize = 500;

/// The subset of service settings every basket needs at hand.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Ceiling for per-basket ring capacity
    pub max_capacity: usize,
    /// Ceiling for page sizes in listing calls
    pub page_limit: usize,
}

/// Script evaluation budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScriptBudget {
    /// Maximum number of engine operations per evaluation
    #[serde(default = "default_script_steps")]
    pub max_steps: u64,
    /// Wall-clock deadline in milliseconds
    #[serde(default = "default_script_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_script_steps() -> u64 {
    1_000_000
}

fn default_script_timeout_ms() -> u64 {
    500
}

impl Default for ScriptBudget {
    fn default() -> Self {
        Self {
            max_steps: default_script_steps(),
            timeout_ms: default_script_timeout_ms(),
        }
    }
}

/// Service-wide engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Ceiling for per-basket ring capacity
    #[serde(default = "default_max_capacity")]
    pub max_capacity: usize,
    /// Capacity assigned to baskets created without an explicit one
    #[serde(default = "default_init_capacity")]
    pub init_capacity: usize,
    /// Page size limit for listing calls
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
    /// Captured bodies are cut off beyond this many bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Timeout for forwarded upstream requests, seconds
    #[serde(default = "default_forward_timeout_secs")]
    pub forward_timeout_secs: u64,
    /// Length of minted basket tokens
    #[serde(default = "default_token_length")]
    pub token_length: usize,
    /// Basket names rejected at creation
    #[serde(default)]
    pub reserved_names: Vec<String>,
    #[serde(default)]
    pub script: ScriptBudget,
}

fn default_max_capacity() -> usize {
    2000
}

fn default_init_capacity() -> usize {
    200
}

fn default_page_limit() -> usize {
    20
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_forward_timeout_secs() -> u64 {
    30
}

fn default_token_length() -> usize {
    32
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_capacity: default_max_capacity(),
            init_capacity: default_init_capacity(),
            page_limit: default_page_limit(),
            max_body_bytes: default_max_body_bytes(),
            forward_timeout_secs: default_forward_timeout_secs(),
            token_length: default_token_length(),
            reserved_names: Vec::new(),
            script: ScriptBudget::default(),
        }
    }
}

impl ServiceConfig {
    /// Load the configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: ServiceConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.max_capacity < 1 {
            anyhow::bail!("max_capacity must be at least 1");
        }
        if self.init_capacity < 1 || self.init_capacity > self.max_capacity {
            anyhow::bail!(
                "init_capacity must be within 1..={}, got {}",
                self.max_capacity,
                self.init_capacity
            );
        }
        if self.page_limit < 1 {
            anyhow::bail!("page_limit must be at least 1");
        }
        if self.token_length < 22 {
            anyhow::bail!("token_length must be at least 22 for adequate entropy");
        }
        if self.forward_timeout_secs == 0 {
            anyhow::bail!("forward_timeout_secs must be positive");
        }
        if self.script.max_steps == 0 || self.script.timeout_ms == 0 {
            anyhow::bail!("script budget must be positive");
        }
        Ok(())
    }

    /// The per-basket limit view, with the page limit clamped to the hard
    /// service ceiling.
    pub fn limits(&self) -> Limits {
        Limits {
            max_capacity: self.max_capacity,
            page_limit: self.page_limit.min(HARD_PAGE_LIMIT),
        }
    }
}
