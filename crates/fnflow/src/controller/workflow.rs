//! Drives `Workflow` aggregates: validates any spec that was appended
//! without going through [`crate::api::WorkflowApi::create`] (e.g. written
//! directly to the log by a migration or another process sharing it).

use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use crate::bus::{BusMessage, EventBus, Selector};
use crate::cache::SubscribedCache;
use crate::eventlog::EventLog;
use crate::model::event::{AggregateRef, AggregateType, EventPayload, WorkflowEventPayload};
use crate::model::status::WorkflowStatus;

use super::invocation::MIN_TICK;

pub struct WorkflowControllerConfig {
    pub tick: Duration,
}

impl Default for WorkflowControllerConfig {
    fn default() -> Self {
        Self { tick: MIN_TICK }
    }
}

pub struct WorkflowController {
    log: Arc<dyn EventLog>,
    cache: Arc<SubscribedCache>,
    bus: EventBus,
    config: WorkflowControllerConfig,
}

impl WorkflowController {
    pub fn new(log: Arc<dyn EventLog>, cache: Arc<SubscribedCache>, bus: EventBus, config: WorkflowControllerConfig) -> Self {
        Self { log, cache, bus, config }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut subscription = self.bus.subscribe(Selector::AggregateType(AggregateType::Workflow));
        let mut interval = tokio::time::interval(self.config.tick);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
                msg = subscription.recv() => {
                    match msg {
                        Some(_) => self.tick().await,
                        None => break,
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn tick(&self) {
        for aggregate in self.cache.list(AggregateType::Workflow) {
            let Some(workflow) = aggregate.as_workflow() else { continue };
            if workflow.status != WorkflowStatus::Pending {
                continue;
            }
            let Some(spec) = &workflow.spec else { continue };

            let aggregate_ref = AggregateRef::workflow(workflow.id);
            let events = match self.log.replay(&aggregate_ref).await {
                Ok(events) => events,
                Err(err) => {
                    warn!(%err, "failed to load workflow events before validating");
                    continue;
                }
            };
            let payload = match spec.validate() {
                Ok(()) => EventPayload::Workflow(WorkflowEventPayload::Validated),
                Err(err) => EventPayload::Workflow(WorkflowEventPayload::ParsingFailed { message: err.to_string() }),
            };
            if let Err(err) = self.log.append(aggregate_ref, events.len() as u64, vec![payload], None).await {
                warn!(%err, "failed to append workflow validation outcome");
            }
        }
    }
}
