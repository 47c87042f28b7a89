//! Status enums for workflows, workflow invocations, and task invocations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::spec::TaskId;
use super::value::TypedValue;

/// Status of a `Workflow` aggregate (the parsed, reusable definition, not a
/// run of it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Parsed but not yet validated against its own invariants.
    Pending,
    /// Validated, resolvable, and available for invocation.
    Ready,
    /// Parsing or validation failed; `status_message` on the aggregate
    /// carries the reason.
    Failed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "PENDING",
            WorkflowStatus::Ready => "READY",
            WorkflowStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Status of a single task invocation within a workflow invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskInvocationStatus {
    Scheduled,
    InProgress,
    Succeeded,
    Failed,
    /// Never invoked because an upstream, non-optional dependency failed or
    /// was skipped itself.
    Skipped,
    Aborted,
}

impl TaskInvocationStatus {
    /// Mirrors the original's `TaskInvocationStatus.Finished()`: any of
    /// these terminal states means the task will not be (re)invoked.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskInvocationStatus::Succeeded
                | TaskInvocationStatus::Failed
                | TaskInvocationStatus::Skipped
                | TaskInvocationStatus::Aborted
        )
    }

    pub fn is_successful(self) -> bool {
        matches!(self, TaskInvocationStatus::Succeeded)
    }
}

/// The record of one task's invocation within a workflow invocation: status
/// plus, once finished, its resolved inputs and output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub task_id: TaskId,
    pub status: TaskInvocationStatus,
    #[serde(default)]
    pub inputs: BTreeMap<String, TypedValue>,
    pub output: Option<TypedValue>,
    pub error: Option<String>,
}

impl TaskInvocation {
    pub fn scheduled(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskInvocationStatus::Scheduled,
            inputs: BTreeMap::new(),
            output: None,
            error: None,
        }
    }
}

/// Status of a `WorkflowInvocation` aggregate — one run of a `WorkflowSpec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowInvocationStatus {
    Unknown,
    Scheduled,
    InProgress,
    Succeeded,
    Failed,
    Aborted,
}

impl WorkflowInvocationStatus {
    /// Mirrors `WorkflowInvocationStatus.Finished()`.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            WorkflowInvocationStatus::Succeeded
                | WorkflowInvocationStatus::Failed
                | WorkflowInvocationStatus::Aborted
        )
    }

    /// Mirrors `WorkflowInvocationStatus.Successful()`.
    pub fn is_successful(self) -> bool {
        matches!(self, WorkflowInvocationStatus::Succeeded)
    }

    /// The terminal `TaskInvocationStatus` a not-yet-run task should adopt
    /// when the whole invocation is aborted, mirroring the status-mapping
    /// table in `WorkflowInvocationStatus.ToTaskStatus()`.
    pub fn to_task_status(self) -> Option<TaskInvocationStatus> {
        match self {
            WorkflowInvocationStatus::Aborted => Some(TaskInvocationStatus::Aborted),
            WorkflowInvocationStatus::Failed => Some(TaskInvocationStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkflowInvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowInvocationStatus::Unknown => "UNKNOWN",
            WorkflowInvocationStatus::Scheduled => "SCHEDULED",
            WorkflowInvocationStatus::InProgress => "IN_PROGRESS",
            WorkflowInvocationStatus::Succeeded => "SUCCEEDED",
            WorkflowInvocationStatus::Failed => "FAILED",
            WorkflowInvocationStatus::Aborted => "ABORTED",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_status_finished_set() {
        assert!(WorkflowInvocationStatus::Succeeded.is_finished());
        assert!(WorkflowInvocationStatus::Failed.is_finished());
        assert!(WorkflowInvocationStatus::Aborted.is_finished());
        assert!(!WorkflowInvocationStatus::InProgress.is_finished());
        assert!(!WorkflowInvocationStatus::Scheduled.is_finished());
    }

    #[test]
    fn task_status_finished_set() {
        assert!(TaskInvocationStatus::Succeeded.is_finished());
        assert!(TaskInvocationStatus::Failed.is_finished());
        assert!(TaskInvocationStatus::Skipped.is_finished());
        assert!(TaskInvocationStatus::Aborted.is_finished());
        assert!(!TaskInvocationStatus::InProgress.is_finished());
    }

    #[test]
    fn abort_maps_to_task_aborted() {
        assert_eq!(
            WorkflowInvocationStatus::Aborted.to_task_status(),
            Some(TaskInvocationStatus::Aborted)
        );
        assert_eq!(WorkflowInvocationStatus::Succeeded.to_task_status(), None);
    }
}
