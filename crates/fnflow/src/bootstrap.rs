//! Typed startup wiring: builds the event log, bus, cache, runtime
//! registry, and controllers from an [`EngineConfig`] and returns them (or
//! an error) rather than panicking partway through, the redesign called
//! for in place of an ad hoc main-function wiring sequence.

use std::sync::Arc;

use crate::api::{WorkflowApi, WorkflowInvocationApi};
use crate::bus::EventBus;
use crate::cache::SubscribedCache;
use crate::config::EngineConfig;
use crate::controller::{InvocationController, InvocationControllerConfig, WorkflowController, WorkflowControllerConfig};
use crate::error::EngineError;
use crate::eventlog::{EventLog, InMemoryEventLog};
use crate::expr::ExpressionResolver;
use crate::meta_controller::MetaController;
use crate::reliability::RetryPolicy;
use crate::runtime::{NoopRuntime, Resolver, RuntimeRegistry, StaticResolver};

/// Everything a host process needs to drive the engine: the two command
/// APIs, plus the meta-controller handle to shut down cleanly.
pub struct Engine {
    pub workflow_api: Arc<WorkflowApi>,
    pub invocation_api: Arc<WorkflowInvocationApi>,
    pub cache: Arc<SubscribedCache>,
    meta_controller: MetaController,
}

impl Engine {
    pub async fn shutdown(self) {
        self.meta_controller.shutdown().await;
    }
}

/// Builds an [`Engine`] wired entirely from in-process, in-memory
/// components — the configuration this crate ships by itself. A host
/// embedding a durable event log or external runtime adapters would call
/// [`bootstrap_with`] instead, supplying its own [`EventLog`]/[`Resolver`]/
/// runtime registrations.
pub async fn bootstrap(config: EngineConfig) -> Result<Engine, EngineError> {
    let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
    let resolver: Arc<dyn Resolver> = Arc::new(StaticResolver::new("noop"));
    let runtimes = Arc::new(RuntimeRegistry::new());
    if config.runtimes.internal.enabled {
        runtimes.register(Arc::new(NoopRuntime));
    }
    bootstrap_with(config, log, resolver, runtimes).await
}

pub async fn bootstrap_with(
    config: EngineConfig,
    log: Arc<dyn EventLog>,
    resolver: Arc<dyn Resolver>,
    runtimes: Arc<RuntimeRegistry>,
) -> Result<Engine, EngineError> {
    let cache = Arc::new(SubscribedCache::new(log.clone()));
    let expr = Arc::new(ExpressionResolver::new(config.expr.timeout));

    let bus_sender = {
        // `EventLog::watch` mints a fresh broadcast receiver; the bus needs
        // the sender side, which only `InMemoryEventLog` exposes directly
        // today. A durable backend would supply its own sender the same
        // way when implementing `EventLog`.
        let rx = log.watch();
        rebroadcast(rx)
    };
    let bus = EventBus::new(bus_sender);

    let workflow_api = Arc::new(WorkflowApi::new(log.clone(), cache.clone()));
    let invocation_api = Arc::new(WorkflowInvocationApi::new(log.clone(), cache.clone()));

    let invocation_controller = config.controller.invocation.enabled.then(|| {
        Arc::new(InvocationController::new(
            log.clone(),
            cache.clone(),
            bus.clone(),
            resolver,
            runtimes,
            expr,
            InvocationControllerConfig {
                tick: config.controller.tick,
                retry_policy: RetryPolicy::standard(),
            },
        ))
    });
    let workflow_controller = config.controller.workflow.enabled.then(|| {
        Arc::new(WorkflowController::new(
            log,
            cache.clone(),
            bus,
            WorkflowControllerConfig { tick: config.controller.tick },
        ))
    });

    let meta_controller = MetaController::spawn(invocation_controller, workflow_controller);

    Ok(Engine {
        workflow_api,
        invocation_api,
        cache,
        meta_controller,
    })
}

/// Forwards every event from one broadcast receiver onto a freshly minted
/// sender, so [`EventBus`] can mint independent receivers without the
/// `EventLog` trait needing to expose its internal sender type.
fn rebroadcast(mut rx: tokio::sync::broadcast::Receiver<crate::model::event::Event>) -> tokio::sync::broadcast::Sender<crate::model::event::Event> {
    let (tx, _) = tokio::sync::broadcast::channel(1024);
    let forward_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let _ = forward_tx.send(event);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_wires_a_working_engine() {
        let engine = bootstrap(EngineConfig::default()).await.unwrap();
        let spec = crate::model::WorkflowSpec::new("t1").with_task("t1", crate::model::TaskSpec::new("noop"));
        let id = engine.invocation_api.invoke(uuid::Uuid::nil(), spec, Default::default(), None).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if let Ok(inv) = engine.invocation_api.get(id).await {
                    if inv.status.is_finished() {
                        break;
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_invocation_controller_never_advances_tasks() {
        let mut config = EngineConfig::default();
        config.controller.invocation.enabled = false;
        let engine = bootstrap(config).await.unwrap();

        let spec = crate::model::WorkflowSpec::new("t1").with_task("t1", crate::model::TaskSpec::new("noop"));
        let id = engine.invocation_api.invoke(uuid::Uuid::nil(), spec, Default::default(), None).await.unwrap();

        // With no invocation controller spawned, nothing ever picks the
        // invocation up for scheduling; it stays pending.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let invocation = engine.invocation_api.get(id).await.unwrap();
        assert!(!invocation.status.is_finished());

        engine.shutdown().await;
    }
}
