//! Sandboxed script evaluation for computed responses.
//!
//! A response marked as a script has its body evaluated by a rhai engine
//! with the captured request exposed as a read-only `request` map. Printed
//! output becomes the response body. The engine has no filesystem, network
//! or process access, and every evaluation runs under a step budget and a
//! wall-clock deadline.
//!
//! Script failures are reported to the caller; they never take the host
//! down.

use crate::basket::record::RequestRecord;
use crate::config::ScriptBudget;
use crate::metrics;
use parking_lot::Mutex;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Scope};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Script evaluation error surface.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("script compile error: {0}")]
    Compile(String),
    #[error("script evaluation error: {0}")]
    Runtime(String),
    #[error("script evaluation exceeded its budget: {0}")]
    Timeout(String),
}

/// Evaluator for response scripts.
#[derive(Debug, Clone, Copy)]
pub struct ScriptSandbox {
    budget: ScriptBudget,
}

impl ScriptSandbox {
    pub fn new(budget: ScriptBudget) -> Self {
        Self { budget }
    }

    /// Build a fresh, restricted engine for one evaluation.
    ///
    /// Printed lines accumulate into `output`, each terminated by a newline.
    fn create_engine(&self, output: Arc<Mutex<String>>) -> Engine {
        let mut engine = Engine::new();

        // no imports: neither filesystem nor any other module source
        engine.set_module_resolver(DummyModuleResolver::new());

        engine.set_max_operations(self.budget.max_steps);
        engine.set_max_call_levels(64);
        engine.set_max_string_size(1024 * 1024);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(100_000);

        let deadline = Instant::now() + std::time::Duration::from_millis(self.budget.timeout_ms);
        engine.on_progress(move |_| {
            if Instant::now() > deadline {
                Some("deadline".into())
            } else {
                None
            }
        });

        engine.on_print(move |msg| {
            let mut buffer = output.lock();
            buffer.push_str(msg);
            buffer.push('\n');
        });

        engine
    }

    /// Evaluate a response script against a captured request.
    ///
    /// Returns the concatenated printed output.
    pub fn eval(
        &self,
        basket: &str,
        script: &str,
        record: &RequestRecord,
    ) -> Result<String, ScriptError> {
        let output = Arc::new(Mutex::new(String::new()));
        let engine = self.create_engine(Arc::clone(&output));

        let ast = engine.compile(script).map_err(|e| {
            metrics::record_script_evaluation("error");
            ScriptError::Compile(e.to_string())
        })?;

        let mut scope = Scope::new();
        scope.push_constant("request", request_to_map(record));

        let started = Instant::now();
        let result = engine.run_ast_with_scope(&mut scope, &ast);
        debug!(
            "Script for basket '{basket}' finished in {:?}",
            started.elapsed()
        );

        match result {
            Ok(()) => {
                metrics::record_script_evaluation("ok");
                Ok(output.lock().clone())
            }
            Err(e) => match *e {
                EvalAltResult::ErrorTooManyOperations(_) => {
                    metrics::record_script_evaluation("timeout");
                    Err(ScriptError::Timeout("step limit reached".to_string()))
                }
                EvalAltResult::ErrorTerminated(_, _) => {
                    metrics::record_script_evaluation("timeout");
                    Err(ScriptError::Timeout("deadline reached".to_string()))
                }
                ref other => {
                    metrics::record_script_evaluation("error");
                    Err(ScriptError::Runtime(other.to_string()))
                }
            },
        }
    }
}

/// Expose the captured request as a script map.
fn request_to_map(record: &RequestRecord) -> Map {
    let mut headers = Map::new();
    for (name, values) in &record.headers {
        let list: Array = values
            .iter()
            .map(|v| Dynamic::from(v.clone()))
            .collect();
        headers.insert(name.clone().into(), Dynamic::from(list));
    }

    let mut map = Map::new();
    map.insert("Date".into(), Dynamic::from(record.date));
    map.insert("ContentLength".into(), Dynamic::from(record.content_length));
    map.insert("Headers".into(), Dynamic::from(headers));
    map.insert("Body".into(), Dynamic::from(record.body.clone()));
    map.insert("Method".into(), Dynamic::from(record.method.clone()));
    map.insert("Path".into(), Dynamic::from(record.path.clone()));
    map.insert("Query".into(), Dynamic::from(record.query.clone()));
    map
}
