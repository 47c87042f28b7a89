//! The command surface: `WorkflowApi` (manage reusable workflow definitions)
//! and `WorkflowInvocationApi` (start/observe/cancel runs of them). These
//! are the traits a gRPC or HTTP gateway would sit in front of; this crate
//! exposes them as plain async functions on in-process structs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::timeout;
use tracing::instrument;
use uuid::Uuid;

use crate::cache::SubscribedCache;
use crate::eventlog::EventLog;
use crate::model::aggregate::{Aggregate, WorkflowAggregate, WorkflowInvocationAggregate};
use crate::model::event::{AggregateRef, EventPayload, InvocationEventPayload, WorkflowEventPayload};
use crate::model::spec::{SpecValidationError, WorkflowSpec};
use crate::model::status::WorkflowInvocationStatus;
use crate::model::value::TypedValue;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Invalid(#[from] SpecValidationError),
    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),
    #[error("invocation {0} not found")]
    InvocationNotFound(Uuid),
    #[error(transparent)]
    Store(#[from] crate::eventlog::StoreError),
    #[error("invocation did not finish within {0:?}")]
    SyncTimeout(Duration),
}

/// Manages `Workflow` aggregates: parsed, validated, reusable specs.
pub struct WorkflowApi {
    log: Arc<dyn EventLog>,
    cache: Arc<SubscribedCache>,
}

impl WorkflowApi {
    pub fn new(log: Arc<dyn EventLog>, cache: Arc<SubscribedCache>) -> Self {
        Self { log, cache }
    }

    /// Parses and validates a spec, persisting the outcome either way —
    /// a spec that fails validation is recorded `Failed`, not rejected
    /// silently, so its history is auditable.
    #[instrument(skip(self, spec))]
    pub async fn create(&self, spec: WorkflowSpec) -> Result<Uuid, ApiError> {
        let id = Uuid::now_v7();
        let aggregate_ref = AggregateRef::workflow(id);

        let mut events = vec![
            EventPayload::Workflow(WorkflowEventPayload::Created { spec: spec.clone() }),
            EventPayload::Workflow(WorkflowEventPayload::Parsed { spec: spec.clone() }),
        ];
        events.push(match spec.validate() {
            Ok(()) => EventPayload::Workflow(WorkflowEventPayload::Validated),
            Err(err) => EventPayload::Workflow(WorkflowEventPayload::ParsingFailed { message: err.to_string() }),
        });

        self.log.append(aggregate_ref, 0, events, None).await?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<WorkflowAggregate, ApiError> {
        let aggregate_ref = AggregateRef::workflow(id);
        if let Some(aggregate) = self.cache.get(&aggregate_ref) {
            return aggregate.as_workflow().cloned().ok_or(ApiError::WorkflowNotFound(id));
        }
        let events = self.log.replay(&aggregate_ref).await?;
        if events.is_empty() {
            return Err(ApiError::WorkflowNotFound(id));
        }
        let aggregate = Aggregate::replay(Aggregate::new_workflow(id), &events).map_err(|e| ApiError::Store(crate::eventlog::StoreError::Serialization(e.to_string())))?;
        aggregate.as_workflow().cloned().ok_or(ApiError::WorkflowNotFound(id))
    }

    pub fn list(&self) -> Vec<WorkflowAggregate> {
        self.cache
            .list(crate::model::event::AggregateType::Workflow)
            .into_iter()
            .filter_map(|a| a.as_workflow().cloned())
            .collect()
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), ApiError> {
        let aggregate_ref = AggregateRef::workflow(id);
        let events = self.log.replay(&aggregate_ref).await?;
        if events.is_empty() {
            return Err(ApiError::WorkflowNotFound(id));
        }
        self.log
            .append(aggregate_ref, events.len() as u64, vec![EventPayload::Workflow(WorkflowEventPayload::Deleted)], None)
            .await?;
        Ok(())
    }

    pub fn validate(&self, spec: &WorkflowSpec) -> Result<(), ApiError> {
        spec.validate().map_err(ApiError::from)
    }
}

/// Manages `WorkflowInvocation` aggregates: runs of a `WorkflowSpec`.
pub struct WorkflowInvocationApi {
    log: Arc<dyn EventLog>,
    cache: Arc<SubscribedCache>,
    /// Maps a caller-supplied `client_request_id` to the invocation id it
    /// produced, so a retried `Invoke` call returns the same id instead of
    /// starting a second run.
    idempotency: DashMap<String, Uuid>,
}

impl WorkflowInvocationApi {
    pub fn new(log: Arc<dyn EventLog>, cache: Arc<SubscribedCache>) -> Self {
        Self {
            log,
            cache,
            idempotency: DashMap::new(),
        }
    }

    /// Starts a new invocation and returns immediately with its id; the
    /// invocation progresses asynchronously as controllers pick it up.
    #[instrument(skip(self, spec, inputs))]
    pub async fn invoke(
        &self,
        workflow_id: Uuid,
        spec: WorkflowSpec,
        inputs: BTreeMap<String, TypedValue>,
        client_request_id: Option<String>,
    ) -> Result<Uuid, ApiError> {
        if let Some(request_id) = &client_request_id {
            if let Some(existing) = self.idempotency.get(request_id) {
                return Ok(*existing);
            }
        }

        let id = Uuid::now_v7();
        let aggregate_ref = AggregateRef::invocation(id);
        self.log
            .append(
                aggregate_ref,
                0,
                vec![EventPayload::WorkflowInvocation(InvocationEventPayload::Created { workflow_id, spec, inputs })],
                client_request_id.clone(),
            )
            .await?;

        if let Some(request_id) = client_request_id {
            self.idempotency.insert(request_id, id);
        }
        Ok(id)
    }

    /// Starts an invocation and blocks until it reaches a terminal status
    /// or `timeout_after` elapses.
    #[instrument(skip(self, spec, inputs))]
    pub async fn invoke_sync(
        &self,
        workflow_id: Uuid,
        spec: WorkflowSpec,
        inputs: BTreeMap<String, TypedValue>,
        timeout_after: Duration,
    ) -> Result<WorkflowInvocationAggregate, ApiError> {
        let id = self.invoke(workflow_id, spec, inputs, None).await?;
        let aggregate_ref = AggregateRef::invocation(id);

        let poll = async {
            loop {
                if let Some(aggregate) = self.cache.get(&aggregate_ref) {
                    if let Some(invocation) = aggregate.as_invocation() {
                        if invocation.status.is_finished() {
                            return invocation.clone();
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        timeout(timeout_after, poll).await.map_err(|_| ApiError::SyncTimeout(timeout_after))
    }

    pub async fn get(&self, id: Uuid) -> Result<WorkflowInvocationAggregate, ApiError> {
        let aggregate_ref = AggregateRef::invocation(id);
        if let Some(aggregate) = self.cache.get(&aggregate_ref) {
            return aggregate.as_invocation().cloned().ok_or(ApiError::InvocationNotFound(id));
        }
        let events = self.log.replay(&aggregate_ref).await?;
        if events.is_empty() {
            return Err(ApiError::InvocationNotFound(id));
        }
        let aggregate = Aggregate::replay(Aggregate::new_invocation(id), &events)
            .map_err(|e| ApiError::Store(crate::eventlog::StoreError::Serialization(e.to_string())))?;
        aggregate.as_invocation().cloned().ok_or(ApiError::InvocationNotFound(id))
    }

    pub fn list(&self, workflow_id: Option<Uuid>) -> Vec<WorkflowInvocationAggregate> {
        self.cache
            .list(crate::model::event::AggregateType::WorkflowInvocation)
            .into_iter()
            .filter_map(|a| a.as_invocation().cloned())
            .filter(|inv| match workflow_id {
                Some(wid) => inv.workflow_id == wid,
                None => true,
            })
            .collect()
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<(), ApiError> {
        let aggregate_ref = AggregateRef::invocation(id);
        let current = self.get(id).await?;
        if current.status.is_finished() {
            return Ok(());
        }
        let events = self.log.replay(&aggregate_ref).await?;
        self.log
            .append(aggregate_ref, events.len() as u64, vec![EventPayload::WorkflowInvocation(InvocationEventPayload::Cancelled)], None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::InMemoryEventLog;
    use crate::model::spec::TaskSpec;

    fn spec() -> WorkflowSpec {
        WorkflowSpec::new("t1").with_task("t1", TaskSpec::new("noop"))
    }

    #[tokio::test]
    async fn create_validates_and_marks_ready() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let cache = Arc::new(SubscribedCache::new(log.clone()));
        let api = WorkflowApi::new(log, cache);

        let id = api.create(spec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let workflow = api.get(id).await.unwrap();
        assert_eq!(workflow.status, crate::model::status::WorkflowStatus::Ready);
    }

    #[tokio::test]
    async fn create_rejects_invalid_spec_with_failed_status() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let cache = Arc::new(SubscribedCache::new(log.clone()));
        let api = WorkflowApi::new(log, cache);

        let bad_spec = WorkflowSpec::new("missing");
        let id = api.create(bad_spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let workflow = api.get(id).await.unwrap();
        assert_eq!(workflow.status, crate::model::status::WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn invoke_with_same_client_request_id_is_idempotent() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let cache = Arc::new(SubscribedCache::new(log.clone()));
        let api = WorkflowInvocationApi::new(log, cache);

        let id1 = api.invoke(Uuid::nil(), spec(), BTreeMap::new(), Some("req-1".into())).await.unwrap();
        let id2 = api.invoke(Uuid::nil(), spec(), BTreeMap::new(), Some("req-1".into())).await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn cancel_on_finished_invocation_is_a_no_op() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let cache = Arc::new(SubscribedCache::new(log.clone()));
        let api = WorkflowInvocationApi::new(log.clone(), cache.clone());

        let id = api.invoke(Uuid::nil(), spec(), BTreeMap::new(), None).await.unwrap();
        let aggregate_ref = AggregateRef::invocation(id);
        log.append(
            aggregate_ref,
            1,
            vec![EventPayload::WorkflowInvocation(InvocationEventPayload::StatusChanged {
                status: WorkflowInvocationStatus::Succeeded,
            })],
            None,
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        api.cancel(id).await.unwrap();
        let invocation = api.get(id).await.unwrap();
        assert_eq!(invocation.status, WorkflowInvocationStatus::Succeeded);
    }
}
