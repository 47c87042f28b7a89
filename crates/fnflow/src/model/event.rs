//! Events: the immutable facts folded by aggregates and carried on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::spec::{TaskId, WorkflowSpec};
use super::status::{TaskInvocationStatus, WorkflowInvocationStatus};
use super::value::TypedValue;

/// Which aggregate type an event belongs to, used for bus/selector routing
/// (`aggregate.type` in label-selector terms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Workflow,
    WorkflowInvocation,
}

impl AggregateType {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateType::Workflow => "workflow",
            AggregateType::WorkflowInvocation => "workflow_invocation",
        }
    }
}

/// Identifies which aggregate instance an event, or a log/bus subscription,
/// refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRef {
    pub aggregate_type: AggregateType,
    pub id: Uuid,
}

impl AggregateRef {
    pub fn new(aggregate_type: AggregateType, id: Uuid) -> Self {
        Self { aggregate_type, id }
    }

    pub fn workflow(id: Uuid) -> Self {
        Self::new(AggregateType::Workflow, id)
    }

    pub fn invocation(id: Uuid) -> Self {
        Self::new(AggregateType::WorkflowInvocation, id)
    }
}

/// The payload of a `Workflow` aggregate's events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkflowEventPayload {
    /// The first event in every `Workflow` aggregate's stream: records the
    /// spec as given, before any parsing/validation has run.
    Created { spec: WorkflowSpec },
    Parsed { spec: WorkflowSpec },
    Validated,
    ParsingFailed { message: String },
    Deleted,
}

/// The payload of a `WorkflowInvocation` aggregate's events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InvocationEventPayload {
    Created {
        workflow_id: Uuid,
        spec: WorkflowSpec,
        inputs: std::collections::BTreeMap<String, TypedValue>,
    },
    Scheduled {
        task_id: TaskId,
        inputs: std::collections::BTreeMap<String, TypedValue>,
    },
    TaskStarted {
        task_id: TaskId,
        resolved_ref: String,
        inputs: std::collections::BTreeMap<String, TypedValue>,
    },
    TaskSucceeded {
        task_id: TaskId,
        output: TypedValue,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskSkipped {
        task_id: TaskId,
        reason: String,
    },
    StatusChanged {
        status: WorkflowInvocationStatus,
    },
    Cancelled,
}

impl InvocationEventPayload {
    /// The task this event concerns, if any — mirrors the original's
    /// `WorkflowEvent.activity_id()` accessor used by replay dispatch.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            InvocationEventPayload::Scheduled { task_id, .. }
            | InvocationEventPayload::TaskStarted { task_id, .. }
            | InvocationEventPayload::TaskSucceeded { task_id, .. }
            | InvocationEventPayload::TaskFailed { task_id, .. }
            | InvocationEventPayload::TaskSkipped { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// The `TaskInvocationStatus` this event transitions its task to, if
    /// the event is task-scoped.
    pub fn task_status(&self) -> Option<TaskInvocationStatus> {
        match self {
            InvocationEventPayload::Scheduled { .. } => Some(TaskInvocationStatus::Scheduled),
            InvocationEventPayload::TaskStarted { .. } => Some(TaskInvocationStatus::InProgress),
            InvocationEventPayload::TaskSucceeded { .. } => Some(TaskInvocationStatus::Succeeded),
            InvocationEventPayload::TaskFailed { .. } => Some(TaskInvocationStatus::Failed),
            InvocationEventPayload::TaskSkipped { .. } => Some(TaskInvocationStatus::Skipped),
            _ => None,
        }
    }
}

/// One payload kind, generic over which aggregate type it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "aggregate_type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    Workflow(WorkflowEventPayload),
    WorkflowInvocation(InvocationEventPayload),
}

/// An immutable, sequenced fact appended to the event log for one aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub aggregate: AggregateRef,
    /// 1-based sequence number within the aggregate's stream.
    pub sequence: u64,
    pub payload: EventPayload,
    pub recorded_at: DateTime<Utc>,
    /// Caller-supplied idempotency key, when the triggering command
    /// supplied one (e.g. `client_request_id` on `Invoke`).
    pub idempotency_key: Option<String>,
}

impl Event {
    pub fn new(aggregate: AggregateRef, sequence: u64, payload: EventPayload) -> Self {
        Self {
            aggregate,
            sequence,
            payload,
            recorded_at: Utc::now(),
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_accessor_finds_scoped_events() {
        let ev = InvocationEventPayload::TaskStarted {
            task_id: "t1".to_string(),
            resolved_ref: "noop:t1".to_string(),
            inputs: Default::default(),
        };
        assert_eq!(ev.task_id(), Some(&"t1".to_string()));
        assert_eq!(InvocationEventPayload::Cancelled.task_id(), None);
    }

    #[test]
    fn task_status_mapping() {
        let ev = InvocationEventPayload::TaskSucceeded {
            task_id: "t1".to_string(),
            output: TypedValue::nil(),
        };
        assert_eq!(ev.task_status(), Some(TaskInvocationStatus::Succeeded));
    }

    #[test]
    fn event_serializes_with_tagged_payload() {
        let ev = Event::new(
            AggregateRef::invocation(Uuid::nil()),
            1,
            EventPayload::WorkflowInvocation(InvocationEventPayload::Cancelled),
        );
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["payload"]["aggregate_type"], "workflow_invocation");
        assert_eq!(json["payload"]["payload"]["type"], "Cancelled");
    }
}
