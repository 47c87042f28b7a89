//! Runtime adapters: the narrow seam between the engine and wherever
//! functions actually execute (a native builtin, a sidecar, a remote FaaS
//! gateway). The engine only ever talks to these two traits.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::value::TypedValue;

/// Carries the cancellation signal for one task invocation into a
/// [`Runtime`] — cancelled when the owning workflow invocation is aborted,
/// so an in-flight call can race the cancellation rather than run to
/// completion regardless. Deadline propagation (spec's `ctx` carrying a
/// per-task deadline) is not wired yet: `TaskSpec` has no per-task timeout
/// field to source one from.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    cancellation: CancellationToken,
}

impl RuntimeContext {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self { cancellation }
    }

    /// A context that can never be cancelled — for callers (tests, `Get`
    /// paths) with no in-flight cancellation to propagate.
    pub fn uncancellable() -> Self {
        Self {
            cancellation: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no runtime registered for function {0:?}")]
    UnknownFunction(String),
    #[error("runtime temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("function invocation failed: {0}")]
    Invocation(String),
}

/// A resolved, runtime-specific reference to a function, opaque to the
/// engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRef {
    pub runtime_name: String,
    pub resolved_ref: String,
}

/// Maps a user-given `function_ref` string to a concrete runtime + a
/// reference that runtime understands.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, function_ref: &str) -> Result<ResolvedRef, RuntimeError>;
}

/// Executes a single, already-resolved function invocation.
#[async_trait]
pub trait Runtime: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        ctx: &RuntimeContext,
        resolved_ref: &str,
        inputs: BTreeMap<String, TypedValue>,
    ) -> Result<TypedValue, RuntimeError>;
}

/// Looks up a function ref in a static table built at construction time —
/// the in-process stand-in for a gateway that would resolve refs by
/// calling out to a function registry.
pub struct StaticResolver {
    table: BTreeMap<String, ResolvedRef>,
    default_runtime: String,
}

impl StaticResolver {
    pub fn new(default_runtime: impl Into<String>) -> Self {
        Self {
            table: BTreeMap::new(),
            default_runtime: default_runtime.into(),
        }
    }

    pub fn with_mapping(mut self, function_ref: impl Into<String>, resolved: ResolvedRef) -> Self {
        self.table.insert(function_ref.into(), resolved);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, function_ref: &str) -> Result<ResolvedRef, RuntimeError> {
        if let Some(resolved) = self.table.get(function_ref) {
            return Ok(resolved.clone());
        }
        Ok(ResolvedRef {
            runtime_name: self.default_runtime.clone(),
            resolved_ref: function_ref.to_string(),
        })
    }
}

/// Dispatches to whichever registered [`Runtime`] matches a resolved ref's
/// `runtime_name`.
pub struct RuntimeRegistry {
    runtimes: DashMap<String, Arc<dyn Runtime>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self { runtimes: DashMap::new() }
    }

    pub fn register(&self, runtime: Arc<dyn Runtime>) {
        self.runtimes.insert(runtime.name().to_string(), runtime);
    }

    pub async fn invoke(
        &self,
        ctx: &RuntimeContext,
        resolved: &ResolvedRef,
        inputs: BTreeMap<String, TypedValue>,
    ) -> Result<TypedValue, RuntimeError> {
        let runtime = self
            .runtimes
            .get(&resolved.runtime_name)
            .ok_or_else(|| RuntimeError::UnknownFunction(resolved.runtime_name.clone()))?
            .clone();
        runtime.invoke(ctx, &resolved.resolved_ref, inputs).await
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Echoes its `default` input, mirroring the original's `builtin.Noop`
/// default function ref — used as the default runtime for task specs that
/// don't name a real function.
pub struct NoopRuntime;

#[async_trait]
impl Runtime for NoopRuntime {
    fn name(&self) -> &str {
        "noop"
    }

    async fn invoke(&self, _ctx: &RuntimeContext, _resolved_ref: &str, inputs: BTreeMap<String, TypedValue>) -> Result<TypedValue, RuntimeError> {
        Ok(inputs.get("default").cloned().unwrap_or_else(TypedValue::nil))
    }
}

/// Sleeps for a configured duration before echoing its input, racing the
/// sleep against `ctx`'s cancellation so a mid-flight `cancel()` actually
/// interrupts it rather than running to completion regardless — used in
/// tests to exercise mid-flight cancellation.
pub struct SleepRuntime {
    pub delay: Duration,
}

#[async_trait]
impl Runtime for SleepRuntime {
    fn name(&self) -> &str {
        "sleep"
    }

    async fn invoke(&self, ctx: &RuntimeContext, _resolved_ref: &str, inputs: BTreeMap<String, TypedValue>) -> Result<TypedValue, RuntimeError> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {
                Ok(inputs.get("default").cloned().unwrap_or_else(TypedValue::nil))
            }
            _ = ctx.cancelled() => Err(RuntimeError::Invocation("cancelled".to_string())),
        }
    }
}

/// Always fails — used in tests to exercise task/workflow abort.
pub struct FailRuntime;

#[async_trait]
impl Runtime for FailRuntime {
    fn name(&self) -> &str {
        "fail"
    }

    async fn invoke(&self, _ctx: &RuntimeContext, resolved_ref: &str, _inputs: BTreeMap<String, TypedValue>) -> Result<TypedValue, RuntimeError> {
        Err(RuntimeError::Invocation(format!("function {resolved_ref:?} always fails")))
    }
}
