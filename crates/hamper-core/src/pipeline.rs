//! The ingest pipeline: store, forward, respond.
//!
//! For every request addressed to a basket the pipeline appends the captured
//! record, forwards it to the configured upstream (unless the request
//! carries the do-not-forward marker) and synthesizes the reply, either from
//! the upstream response or from the basket's response configuration.
//!
//! Nothing in here fails visibly to the inbound client: upstream outages
//! turn into synthesized 502 replies, script and template errors into
//! plain-text error bodies.

use crate::basket::record::{ForwardClient, RequestRecord};
use crate::basket::types::{Headers, ResponseConfig, StoreError};
use crate::config::ServiceConfig;
use crate::metrics;
use crate::scripting::ScriptSandbox;
use crate::storage::BasketStore;
use crate::template;
use std::time::Duration;
use tracing::{debug, warn};

/// Reply produced by the pipeline for the inbound client.
#[derive(Debug, Clone)]
pub struct IngestReply {
    pub status: u16,
    pub headers: Headers,
    pub body: String,
}

/// Processes requests addressed to baskets.
pub struct IngestPipeline {
    client: ForwardClient,
    sandbox: ScriptSandbox,
}

impl IngestPipeline {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            client: ForwardClient::new(Duration::from_secs(config.forward_timeout_secs)),
            sandbox: ScriptSandbox::new(config.script),
        }
    }

    /// Run one captured request through the pipeline.
    ///
    /// Returns `None` when no basket with that name exists.
    pub async fn process(
        &self,
        store: &dyn BasketStore,
        name: &str,
        record: RequestRecord,
    ) -> Option<IngestReply> {
        let basket = store.get(name)?;

        // keep the captured record around so a storage hiccup cannot fail
        // the inbound caller; only a released store ends processing
        let record = match basket.add(record.clone()) {
            Ok(stored) => stored,
            Err(StoreError::Closed) => return None,
            Err(e) => {
                warn!("Failed to store request for basket '{name}': {e}");
                record
            }
        };
        let config = match basket.config() {
            Ok(config) => config,
            Err(_) => return None,
        };

        // forwarding happens outside any basket lock
        let forwarded = if config.forward_url.is_empty() {
            None
        } else if record.has_do_not_forward_marker() {
            debug!("Forwarding for basket '{name}' suppressed by marker header");
            metrics::record_forward("skipped");
            None
        } else {
            match record.forward(&self.client, &config, name).await {
                Ok(response) => Some(response),
                Err(e) => {
                    // configuration problem; the inbound client still gets
                    // the configured response
                    warn!("Cannot forward for basket '{name}': {e}");
                    None
                }
            }
        };

        if config.proxy_response {
            if let Some(upstream) = forwarded {
                return Some(IngestReply {
                    status: upstream.status,
                    headers: upstream.headers,
                    body: upstream.body,
                });
            }
        }

        let response = basket
            .get_response(&record.method.to_uppercase())
            .ok()
            .flatten()
            .or_else(|| basket.get_response("").ok().flatten())
            .unwrap_or_default();
        Some(self.render(name, &response, &record))
    }

    /// Produce the reply from a response configuration.
    fn render(&self, name: &str, response: &ResponseConfig, record: &RequestRecord) -> IngestReply {
        let body = if response.is_script {
            match self.sandbox.eval(name, &response.body, record) {
                Ok(output) => output,
                Err(e) => {
                    warn!("Response script for basket '{name}' failed: {e}");
                    format!("Error evaluating response script: {e}")
                }
            }
        } else if response.is_template {
            template::expand(&response.body, record)
        } else {
            response.body.clone()
        };

        IngestReply {
            status: response.status,
            headers: response.headers.clone(),
            body,
        }
    }
}
