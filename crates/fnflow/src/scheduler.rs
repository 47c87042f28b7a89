//! The scheduler: a pure function from `(WorkflowSpec, current task statuses)`
//! to a list of proposed actions. No I/O, no clock — equal inputs always
//! produce an equal, deterministically ordered `Schedule`.

use std::collections::BTreeMap;

use crate::model::spec::{TaskId, WorkflowSpec};
use crate::model::status::{TaskInvocationStatus, WorkflowInvocationStatus};

/// One proposed next step for a workflow invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleAction {
    InvokeTask(TaskId),
    SkipTask { task_id: TaskId, reason: String },
    AbortWorkflow { reason: String },
    Complete,
}

/// The output of [`schedule`]: zero or more actions, always in a
/// deterministic order (lexicographic by task id, with workflow-level
/// actions last).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    pub actions: Vec<ScheduleAction>,
}

impl Schedule {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Counts how many of a task's dependencies have satisfied its `await`
/// requirement: a finished, non-skipped dependency always counts; a
/// `Skipped` dependency counts only when the edge marks it `optional`.
fn satisfied_dependency_count(task_id: &TaskId, spec: &WorkflowSpec, statuses: &BTreeMap<TaskId, TaskInvocationStatus>) -> usize {
    let Some(task) = spec.tasks.get(task_id) else {
        return 0;
    };
    task.requires
        .iter()
        .filter(|(dep_id, params)| match statuses.get(*dep_id) {
            Some(TaskInvocationStatus::Succeeded) => true,
            Some(TaskInvocationStatus::Skipped) => params.optional,
            _ => false,
        })
        .count()
}

/// True if any non-optional dependency of `task_id` finished in a way that
/// can never satisfy it (failed, aborted, or skipped-but-required).
fn has_blocking_dependency(task_id: &TaskId, spec: &WorkflowSpec, statuses: &BTreeMap<TaskId, TaskInvocationStatus>) -> bool {
    let Some(task) = spec.tasks.get(task_id) else {
        return false;
    };
    task.requires.iter().any(|(dep_id, params)| match statuses.get(dep_id) {
        Some(TaskInvocationStatus::Failed) | Some(TaskInvocationStatus::Aborted) => true,
        Some(TaskInvocationStatus::Skipped) => !params.optional,
        _ => false,
    })
}

/// Computes the next actions for a workflow invocation given its spec and
/// the current status of every task. Tasks are visited in id order so
/// ties (e.g. two tasks becoming ready simultaneously) resolve
/// deterministically.
pub fn schedule(spec: &WorkflowSpec, invocation_status: WorkflowInvocationStatus, statuses: &BTreeMap<TaskId, TaskInvocationStatus>) -> Schedule {
    let mut actions = Vec::new();

    if invocation_status.is_finished() {
        return Schedule::default();
    }

    for task_id in spec.task_ids() {
        let status = statuses.get(task_id).copied();
        if status.is_some_and(TaskInvocationStatus::is_finished) {
            continue;
        }
        // A task already Scheduled or InProgress is in flight; the
        // scheduler never re-proposes it.
        if matches!(status, Some(TaskInvocationStatus::Scheduled) | Some(TaskInvocationStatus::InProgress)) {
            continue;
        }

        if has_blocking_dependency(task_id, spec, statuses) {
            actions.push(ScheduleAction::SkipTask {
                task_id: task_id.clone(),
                reason: "a required dependency failed, was aborted, or was skipped".to_string(),
            });
            continue;
        }

        let Some(task) = spec.tasks.get(task_id) else {
            continue;
        };
        if satisfied_dependency_count(task_id, spec, statuses) >= task.await_count {
            actions.push(ScheduleAction::InvokeTask(task_id.clone()));
        }
    }

    // Completion/abort checks run after per-task proposals so that a
    // schedule which both advances tasks and detects terminal state in
    // the same tick reports both — the caller applies task actions first.
    let output_status = statuses.get(&spec.output_task).copied();
    match output_status {
        Some(TaskInvocationStatus::Succeeded) => actions.push(ScheduleAction::Complete),
        Some(TaskInvocationStatus::Failed) => actions.push(ScheduleAction::AbortWorkflow {
            reason: format!("output task {:?} failed", spec.output_task),
        }),
        Some(TaskInvocationStatus::Skipped) | Some(TaskInvocationStatus::Aborted) => {
            actions.push(ScheduleAction::AbortWorkflow {
                reason: format!("output task {:?} did not complete", spec.output_task),
            })
        }
        _ => {}
    }

    Schedule { actions }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::spec::{DependencyParams, TaskSpec};

    fn statuses(pairs: &[(&str, TaskInvocationStatus)]) -> BTreeMap<TaskId, TaskInvocationStatus> {
        pairs.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    #[test]
    fn single_task_is_invoked_when_no_dependencies() {
        let spec = WorkflowSpec::new("t1").with_task("t1", TaskSpec::new("noop"));
        let result = schedule(&spec, WorkflowInvocationStatus::Scheduled, &BTreeMap::new());
        assert_eq!(result.actions, vec![ScheduleAction::InvokeTask("t1".into())]);
    }

    #[test]
    fn downstream_task_waits_for_dependency() {
        let spec = WorkflowSpec::new("t2")
            .with_task("t1", TaskSpec::new("noop"))
            .with_task("t2", TaskSpec::new("noop").requires("t1", DependencyParams::default()));
        let result = schedule(&spec, WorkflowInvocationStatus::Scheduled, &statuses(&[("t1", TaskInvocationStatus::Scheduled)]));
        assert!(result.actions.is_empty());
    }

    #[test]
    fn downstream_task_invoked_once_dependency_succeeds() {
        let spec = WorkflowSpec::new("t2")
            .with_task("t1", TaskSpec::new("noop"))
            .with_task("t2", TaskSpec::new("noop").requires("t1", DependencyParams::default()));
        let result = schedule(&spec, WorkflowInvocationStatus::InProgress, &statuses(&[("t1", TaskInvocationStatus::Succeeded)]));
        assert_eq!(result.actions, vec![ScheduleAction::InvokeTask("t2".into())]);
    }

    #[test]
    fn diamond_both_branches_invoked_in_order() {
        let spec = WorkflowSpec::new("d")
            .with_task("a", TaskSpec::new("noop"))
            .with_task("b", TaskSpec::new("noop").requires("a", DependencyParams::default()))
            .with_task("c", TaskSpec::new("noop").requires("a", DependencyParams::default()))
            .with_task(
                "d",
                TaskSpec::new("noop")
                    .requires("b", DependencyParams::default())
                    .requires("c", DependencyParams::default()),
            );
        let result = schedule(
            &spec,
            WorkflowInvocationStatus::InProgress,
            &statuses(&[("a", TaskInvocationStatus::Succeeded)]),
        );
        assert_eq!(result.actions, vec![ScheduleAction::InvokeTask("b".into()), ScheduleAction::InvokeTask("c".into())]);
    }

    #[test]
    fn output_task_success_completes_workflow() {
        let spec = WorkflowSpec::new("t1").with_task("t1", TaskSpec::new("noop"));
        let result = schedule(
            &spec,
            WorkflowInvocationStatus::InProgress,
            &statuses(&[("t1", TaskInvocationStatus::Succeeded)]),
        );
        assert_eq!(result.actions, vec![ScheduleAction::Complete]);
    }

    #[test]
    fn failed_dependency_skips_downstream_task() {
        let spec = WorkflowSpec::new("t2")
            .with_task("t1", TaskSpec::new("noop"))
            .with_task("t2", TaskSpec::new("noop").requires("t1", DependencyParams::default()));
        let result = schedule(&spec, WorkflowInvocationStatus::InProgress, &statuses(&[("t1", TaskInvocationStatus::Failed)]));
        assert_eq!(
            result.actions,
            vec![ScheduleAction::SkipTask {
                task_id: "t2".into(),
                reason: "a required dependency failed, was aborted, or was skipped".to_string()
            }]
        );
    }

    #[test]
    fn optional_skip_still_satisfies_await() {
        let spec = WorkflowSpec::new("t2")
            .with_task("t1", TaskSpec::new("noop"))
            .with_task("t2", TaskSpec::new("noop").requires("t1", DependencyParams::optional()));
        let result = schedule(&spec, WorkflowInvocationStatus::InProgress, &statuses(&[("t1", TaskInvocationStatus::Skipped)]));
        assert_eq!(result.actions, vec![ScheduleAction::InvokeTask("t2".into())]);
    }

    #[test]
    fn already_finished_invocation_proposes_nothing() {
        let spec = WorkflowSpec::new("t1").with_task("t1", TaskSpec::new("noop"));
        let result = schedule(&spec, WorkflowInvocationStatus::Succeeded, &BTreeMap::new());
        assert!(result.is_empty());
    }

    #[test]
    fn equal_inputs_yield_equal_schedule() {
        let spec = WorkflowSpec::new("t1").with_task("t1", TaskSpec::new("noop"));
        let a = schedule(&spec, WorkflowInvocationStatus::Scheduled, &BTreeMap::new());
        let b = schedule(&spec, WorkflowInvocationStatus::Scheduled, &BTreeMap::new());
        assert_eq!(a, b);
    }
}
