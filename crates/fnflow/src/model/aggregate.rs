//! Aggregates: the folded, queryable state built by replaying events.
//!
//! Each aggregate is a pure reducer over its own event stream — `apply_event`
//! takes `&mut self` and a single [`Event`], never touching the clock or any
//! I/O, so replay is exactly "fold the log".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::event::{AggregateRef, AggregateType, Event, EventPayload, InvocationEventPayload, WorkflowEventPayload};
use super::spec::{TaskId, WorkflowSpec};
use super::status::{TaskInvocation, TaskInvocationStatus, WorkflowInvocationStatus, WorkflowStatus};
use super::value::TypedValue;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("event for aggregate type {event:?} applied to {aggregate:?} aggregate")]
    AggregateTypeMismatch {
        aggregate: AggregateType,
        event: AggregateType,
    },
    #[error("event references unknown task {0:?}")]
    UnknownTask(TaskId),
    #[error("workflow aggregate has no spec yet")]
    NoSpec,
}

/// A `Workflow` aggregate: the parsed, validated definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAggregate {
    pub id: Uuid,
    pub spec: Option<WorkflowSpec>,
    pub status: WorkflowStatus,
    pub status_message: Option<String>,
}

impl WorkflowAggregate {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            spec: None,
            status: WorkflowStatus::Pending,
            status_message: None,
        }
    }

    fn apply(&mut self, payload: &WorkflowEventPayload) {
        match payload {
            WorkflowEventPayload::Created { spec } => {
                self.spec = Some(spec.clone());
            }
            WorkflowEventPayload::Parsed { spec } => {
                self.spec = Some(spec.clone());
            }
            WorkflowEventPayload::Validated => {
                self.status = WorkflowStatus::Ready;
                self.status_message = None;
            }
            WorkflowEventPayload::ParsingFailed { message } => {
                self.status = WorkflowStatus::Failed;
                self.status_message = Some(message.clone());
            }
            WorkflowEventPayload::Deleted => {
                self.spec = None;
            }
        }
    }
}

/// A `WorkflowInvocation` aggregate: one run of a `WorkflowSpec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInvocationAggregate {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub spec: Option<WorkflowSpec>,
    pub inputs: BTreeMap<String, TypedValue>,
    pub status: WorkflowInvocationStatus,
    pub tasks: BTreeMap<TaskId, TaskInvocation>,
    pub output: Option<TypedValue>,
}

impl WorkflowInvocationAggregate {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            workflow_id: Uuid::nil(),
            spec: None,
            inputs: BTreeMap::new(),
            status: WorkflowInvocationStatus::Unknown,
            tasks: BTreeMap::new(),
            output: None,
        }
    }

    /// Statuses of every task, as the scheduler needs them.
    pub fn task_statuses(&self) -> BTreeMap<TaskId, TaskInvocationStatus> {
        self.tasks.iter().map(|(id, t)| (id.clone(), t.status)).collect()
    }

    fn apply(&mut self, payload: &InvocationEventPayload) -> Result<(), ApplyError> {
        match payload {
            InvocationEventPayload::Created { workflow_id, spec, inputs } => {
                self.workflow_id = *workflow_id;
                self.spec = Some(spec.clone());
                self.inputs = inputs.clone();
                self.status = WorkflowInvocationStatus::Scheduled;
                for task_id in spec.task_ids() {
                    self.tasks
                        .entry(task_id.clone())
                        .or_insert_with(|| TaskInvocation::scheduled(task_id.clone()));
                    self.tasks.get_mut(task_id).unwrap().status = TaskInvocationStatus::Scheduled;
                }
            }
            InvocationEventPayload::Scheduled { task_id, inputs } => {
                let task = self
                    .tasks
                    .get_mut(task_id)
                    .ok_or_else(|| ApplyError::UnknownTask(task_id.clone()))?;
                task.status = TaskInvocationStatus::Scheduled;
                task.inputs = inputs.clone();
                self.status = WorkflowInvocationStatus::InProgress;
            }
            InvocationEventPayload::TaskStarted { task_id, inputs, .. } => {
                let task = self
                    .tasks
                    .get_mut(task_id)
                    .ok_or_else(|| ApplyError::UnknownTask(task_id.clone()))?;
                task.status = TaskInvocationStatus::InProgress;
                task.inputs = inputs.clone();
            }
            InvocationEventPayload::TaskSucceeded { task_id, output } => {
                let task = self
                    .tasks
                    .get_mut(task_id)
                    .ok_or_else(|| ApplyError::UnknownTask(task_id.clone()))?;
                task.status = TaskInvocationStatus::Succeeded;
                task.output = Some(output.clone());
                task.error = None;
                if self.spec.as_ref().map(|s| &s.output_task) == Some(task_id) {
                    self.output = Some(output.clone());
                }
            }
            InvocationEventPayload::TaskFailed { task_id, error } => {
                let task = self
                    .tasks
                    .get_mut(task_id)
                    .ok_or_else(|| ApplyError::UnknownTask(task_id.clone()))?;
                task.status = TaskInvocationStatus::Failed;
                task.error = Some(error.clone());
            }
            InvocationEventPayload::TaskSkipped { task_id, reason } => {
                let task = self
                    .tasks
                    .get_mut(task_id)
                    .ok_or_else(|| ApplyError::UnknownTask(task_id.clone()))?;
                task.status = TaskInvocationStatus::Skipped;
                task.error = Some(reason.clone());
            }
            InvocationEventPayload::StatusChanged { status } => {
                self.status = *status;
                if let Some(terminal_task_status) = status.to_task_status() {
                    for task in self.tasks.values_mut() {
                        if !task.status.is_finished() {
                            task.status = terminal_task_status;
                        }
                    }
                }
            }
            InvocationEventPayload::Cancelled => {
                self.status = WorkflowInvocationStatus::Aborted;
                for task in self.tasks.values_mut() {
                    if !task.status.is_finished() {
                        task.status = TaskInvocationStatus::Aborted;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Either kind of aggregate this crate's event log carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Aggregate {
    Workflow(WorkflowAggregate),
    WorkflowInvocation(WorkflowInvocationAggregate),
}

impl Aggregate {
    pub fn new_workflow(id: Uuid) -> Self {
        Aggregate::Workflow(WorkflowAggregate::new(id))
    }

    pub fn new_invocation(id: Uuid) -> Self {
        Aggregate::WorkflowInvocation(WorkflowInvocationAggregate::new(id))
    }

    pub fn aggregate_ref(&self) -> AggregateRef {
        match self {
            Aggregate::Workflow(w) => AggregateRef::workflow(w.id),
            Aggregate::WorkflowInvocation(i) => AggregateRef::invocation(i.id),
        }
    }

    /// Folds one event into this aggregate's state. Never performs I/O or
    /// reads the clock — replay is simply repeated application.
    pub fn apply_event(&mut self, event: &Event) -> Result<(), ApplyError> {
        match (self, &event.payload) {
            (Aggregate::Workflow(w), EventPayload::Workflow(p)) => {
                w.apply(p);
                Ok(())
            }
            (Aggregate::WorkflowInvocation(i), EventPayload::WorkflowInvocation(p)) => i.apply(p),
            (agg, payload) => Err(ApplyError::AggregateTypeMismatch {
                aggregate: agg.aggregate_ref().aggregate_type,
                event: match payload {
                    EventPayload::Workflow(_) => AggregateType::Workflow,
                    EventPayload::WorkflowInvocation(_) => AggregateType::WorkflowInvocation,
                },
            }),
        }
    }

    /// Folds a full event stream from scratch, mirroring the fold-based
    /// `Aggregate::fold` pattern: `events.try_fold(initial, Self::apply)`.
    pub fn replay(mut initial: Aggregate, events: &[Event]) -> Result<Aggregate, ApplyError> {
        for event in events {
            initial.apply_event(event)?;
        }
        Ok(initial)
    }

    /// A deep, owned snapshot — the cache never hands out a reference into
    /// live state, only copies taken at a point in the fold.
    pub fn generic_copy(&self) -> Aggregate {
        self.clone()
    }

    pub fn as_invocation(&self) -> Option<&WorkflowInvocationAggregate> {
        match self {
            Aggregate::WorkflowInvocation(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_workflow(&self) -> Option<&WorkflowAggregate> {
        match self {
            Aggregate::Workflow(w) => Some(w),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::spec::{DependencyParams, TaskSpec};

    fn spec() -> WorkflowSpec {
        WorkflowSpec::new("t2")
            .with_task("t1", TaskSpec::new("noop"))
            .with_task("t2", TaskSpec::new("noop").requires("t1", DependencyParams::default()))
    }

    #[test]
    fn created_seeds_all_tasks_as_scheduled() {
        let id = Uuid::nil();
        let agg = Aggregate::new_invocation(id);
        let event = Event::new(
            AggregateRef::invocation(id),
            1,
            EventPayload::WorkflowInvocation(InvocationEventPayload::Created {
                workflow_id: Uuid::nil(),
                spec: spec(),
                inputs: BTreeMap::new(),
            }),
        );
        let agg = Aggregate::replay(agg, &[event]).unwrap();
        let inv = agg.as_invocation().unwrap();
        assert_eq!(inv.tasks.len(), 2);
        assert_eq!(inv.status, WorkflowInvocationStatus::Scheduled);
    }

    #[test]
    fn succeeding_output_task_sets_invocation_output() {
        let id = Uuid::nil();
        let agg = Aggregate::new_invocation(id);
        let events = vec![
            Event::new(
                AggregateRef::invocation(id),
                1,
                EventPayload::WorkflowInvocation(InvocationEventPayload::Created {
                    workflow_id: Uuid::nil(),
                    spec: spec(),
                    inputs: BTreeMap::new(),
                }),
            ),
            Event::new(
                AggregateRef::invocation(id),
                2,
                EventPayload::WorkflowInvocation(InvocationEventPayload::TaskSucceeded {
                    task_id: "t2".to_string(),
                    output: TypedValue::string("done"),
                }),
            ),
        ];
        let agg = Aggregate::replay(agg, &events).unwrap();
        let inv = agg.as_invocation().unwrap();
        assert_eq!(inv.output, Some(TypedValue::string("done")));
    }

    #[test]
    fn cancel_aborts_unfinished_tasks_only() {
        let id = Uuid::nil();
        let agg = Aggregate::new_invocation(id);
        let events = vec![
            Event::new(
                AggregateRef::invocation(id),
                1,
                EventPayload::WorkflowInvocation(InvocationEventPayload::Created {
                    workflow_id: Uuid::nil(),
                    spec: spec(),
                    inputs: BTreeMap::new(),
                }),
            ),
            Event::new(
                AggregateRef::invocation(id),
                2,
                EventPayload::WorkflowInvocation(InvocationEventPayload::TaskSucceeded {
                    task_id: "t1".to_string(),
                    output: TypedValue::nil(),
                }),
            ),
            Event::new(AggregateRef::invocation(id), 3, EventPayload::WorkflowInvocation(InvocationEventPayload::Cancelled)),
        ];
        let agg = Aggregate::replay(agg, &events).unwrap();
        let inv = agg.as_invocation().unwrap();
        assert_eq!(inv.tasks["t1"].status, TaskInvocationStatus::Succeeded);
        assert_eq!(inv.tasks["t2"].status, TaskInvocationStatus::Aborted);
        assert_eq!(inv.status, WorkflowInvocationStatus::Aborted);
    }

    #[test]
    fn mismatched_event_type_rejected() {
        let id = Uuid::nil();
        let mut agg = Aggregate::new_workflow(id);
        let event = Event::new(
            AggregateRef::workflow(id),
            1,
            EventPayload::WorkflowInvocation(InvocationEventPayload::Cancelled),
        );
        assert!(agg.apply_event(&event).is_err());
    }
}
