//! Expression resolution: evaluating `TypedValue::Expression` values against
//! a per-invocation scope, under a hard deadline, in an isolated sandbox.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, Scope};
use thiserror::Error;
use uuid::Uuid;

use crate::model::value::{TypedValue, ValueType};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Binding name for the invocation scope inside an expression, mirroring
/// the original's `varScope = "$"`.
const VAR_SCOPE: &str = "$";
/// Binding name for the id of the task whose input is being resolved,
/// mirroring the original's `varCurrentTask = "taskId"`.
const VAR_CURRENT_TASK: &str = "taskId";

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("expression exceeded its {limit:?} deadline")]
    Timeout { limit: Duration },
    #[error("expression evaluation failed: {0}")]
    Eval(String),
    #[error("expression referenced unknown task or field: {0}")]
    UnknownReference(String),
}

/// The data an expression may read: `$.tasks.<id>.output`, `$.inputs.<name>`,
/// and so on. Built fresh for each resolution call — never mutated by a
/// prior evaluation, since sandboxes must be isolated per the redesign in
/// [`crate::expr`]'s module docs.
#[derive(Debug, Clone, Default)]
pub struct ScopeData {
    pub task_outputs: BTreeMap<String, serde_json::Value>,
    pub invocation_inputs: BTreeMap<String, serde_json::Value>,
}

/// Builds per-evaluation sandboxes from a shared, read-only-configured
/// `rhai::Engine`. Cloning the engine is cheap and each clone starts a
/// fresh interpreter with no carried-over mutable state, which is what
/// makes concurrent resolutions safe to run without locking.
pub struct ExpressionResolver {
    engine: Engine,
    timeout: Duration,
}

impl ExpressionResolver {
    pub fn new(timeout: Duration) -> Self {
        let mut engine = Engine::new();
        engine.set_max_expr_depths(64, 64);
        engine.register_fn("uid", || Uuid::new_v4().to_string());
        Self { engine, timeout }
    }

    /// Resolves one expression source string against `scope_data` and the
    /// id of the task this value belongs to. The result is always re-typed
    /// with [`TypedValue::parse`] and stamped with a `src` label carrying
    /// the original source, matching `result.SetLabel("src", e)` in the
    /// original resolver.
    pub fn resolve_expression(&self, src: &str, scope_data: &ScopeData, current_task: &str) -> Result<TypedValue, ExprError> {
        let mut engine = self.engine.clone();
        let deadline = Instant::now() + self.timeout;
        let timeout = self.timeout;
        let ticks = Arc::new(AtomicU64::new(0));
        let ticks_for_hook = ticks.clone();
        engine.on_progress(move |_ops| {
            ticks_for_hook.fetch_add(1, Ordering::Relaxed);
            if Instant::now() >= deadline {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });

        let mut scope = Scope::new();
        scope.push_constant(VAR_SCOPE, scope_data_to_dynamic(scope_data));
        scope.push_constant(VAR_CURRENT_TASK, current_task.to_string());

        let result: Result<Dynamic, _> = engine.eval_with_scope(&mut scope, src);
        let value = match result {
            Ok(v) => v,
            Err(err) => {
                if matches!(*err, rhai::EvalAltResult::ErrorTerminated(..)) {
                    return Err(ExprError::Timeout { limit: timeout });
                }
                return Err(ExprError::Eval(err.to_string()));
            }
        };

        let json = dynamic_to_json(value).map_err(ExprError::Eval)?;
        Ok(TypedValue::parse(json).with_label("src", src))
    }

    /// Recursively resolves every `Expression` value reachable inside
    /// `value` (through `Map`/`List` nesting), leaving scalars untouched.
    pub fn resolve(&self, value: &TypedValue, scope_data: &ScopeData, current_task: &str) -> Result<TypedValue, ExprError> {
        match value.value_type {
            ValueType::Expression => {
                let src = value.expression_source().unwrap_or_default();
                self.resolve_expression(src, scope_data, current_task)
            }
            ValueType::List => {
                let items = value.value.as_array().cloned().unwrap_or_default();
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    let typed = TypedValue::parse(item);
                    resolved.push(self.resolve(&typed, scope_data, current_task)?.value);
                }
                Ok(TypedValue::new(ValueType::List, serde_json::Value::Array(resolved)))
            }
            ValueType::Map => {
                let obj = value.value.as_object().cloned().unwrap_or_default();
                let mut resolved = serde_json::Map::with_capacity(obj.len());
                for (k, v) in obj {
                    let typed = TypedValue::parse(v);
                    resolved.insert(k, self.resolve(&typed, scope_data, current_task)?.value);
                }
                Ok(TypedValue::new(ValueType::Map, serde_json::Value::Object(resolved)))
            }
            _ => Ok(value.clone()),
        }
    }
}

fn scope_data_to_dynamic(data: &ScopeData) -> Dynamic {
    let mut tasks_map = rhai::Map::new();
    for (id, output) in &data.task_outputs {
        tasks_map.insert(id.as_str().into(), json_to_dynamic(output));
    }
    let mut inputs_map = rhai::Map::new();
    for (name, value) in &data.invocation_inputs {
        inputs_map.insert(name.as_str().into(), json_to_dynamic(value));
    }
    let mut root = rhai::Map::new();
    root.insert("tasks".into(), Dynamic::from_map(tasks_map));
    root.insert("inputs".into(), Dynamic::from_map(inputs_map));
    Dynamic::from_map(root)
}

fn json_to_dynamic(value: &serde_json::Value) -> Dynamic {
    match value {
        serde_json::Value::Null => Dynamic::UNIT,
        serde_json::Value::Bool(b) => Dynamic::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else {
                Dynamic::from(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Dynamic::from(s.clone()),
        serde_json::Value::Array(items) => {
            Dynamic::from_array(items.iter().map(json_to_dynamic).collect())
        }
        serde_json::Value::Object(obj) => {
            let mut map = rhai::Map::new();
            for (k, v) in obj {
                map.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from_map(map)
        }
    }
}

fn dynamic_to_json(value: Dynamic) -> Result<serde_json::Value, String> {
    serde_json::to_value(&value).map_err(|e| e.to_string())
}
