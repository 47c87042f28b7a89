//! Declarative workflow/task specifications — the immutable "user intent"
//! half of an aggregate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::value::TypedValue;

pub type TaskId = String;
pub type InputName = String;

/// How a task relates to one of its dependencies.
///
/// `DynamicOutput` marks the dependency whose resolved output becomes this
/// task's parent scope, enabling workflow-returning tasks (a task whose
/// output is itself a nested [`WorkflowSpec`] to expand and run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Normal,
    DynamicOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyParams {
    #[serde(rename = "type", default = "default_dependency_kind")]
    pub kind: DependencyKind,
    /// When true, this dependency finishing as `Skipped` still counts
    /// towards `TaskSpec::await_count` being satisfied (open question (b)
    /// in the design notes, resolved in DESIGN.md).
    #[serde(default)]
    pub optional: bool,
}

fn default_dependency_kind() -> DependencyKind {
    DependencyKind::Normal
}

impl Default for DependencyParams {
    fn default() -> Self {
        Self {
            kind: DependencyKind::Normal,
            optional: false,
        }
    }
}

impl DependencyParams {
    pub fn dynamic_output() -> Self {
        Self {
            kind: DependencyKind::DynamicOutput,
            optional: false,
        }
    }

    pub fn optional() -> Self {
        Self {
            kind: DependencyKind::Normal,
            optional: true,
        }
    }
}

/// A single task in a [`WorkflowSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// User-given function name, resolved later to a concrete runtime +
    /// function by a [`crate::runtime::Resolver`].
    pub function_ref: String,
    #[serde(default)]
    pub requires: BTreeMap<TaskId, DependencyParams>,
    /// Number of dependencies that must finish before this task is ready.
    /// May be less than `requires.len()` when some dependencies are
    /// optional.
    pub await_count: usize,
    #[serde(default)]
    pub inputs: BTreeMap<InputName, TypedValue>,
}

impl TaskSpec {
    /// Default function ref used when a task spec omits `run`, mirroring
    /// the original's `defaultFunctionRef = builtin.Noop`.
    pub const DEFAULT_FUNCTION_REF: &'static str = "noop";

    pub fn new(function_ref: impl Into<String>) -> Self {
        Self {
            function_ref: function_ref.into(),
            requires: BTreeMap::new(),
            await_count: 0,
            inputs: BTreeMap::new(),
        }
    }

    pub fn requires(mut self, task_id: impl Into<TaskId>, params: DependencyParams) -> Self {
        self.requires.insert(task_id.into(), params);
        self.await_count = self.requires.len();
        self
    }

    pub fn with_await(mut self, await_count: usize) -> Self {
        self.await_count = await_count;
        self
    }

    pub fn with_input(mut self, name: impl Into<InputName>, value: TypedValue) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    /// The dependency this task inherits a dynamic parent scope from, if any.
    pub fn dynamic_parent(&self) -> Option<&TaskId> {
        self.requires
            .iter()
            .find(|(_, params)| params.kind == DependencyKind::DynamicOutput)
            .map(|(id, _)| id)
    }
}

/// A declarative task graph: inputs flow along `requires` edges, and the
/// workflow's overall output is the output of `output_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub api_version: String,
    pub output_task: TaskId,
    pub tasks: BTreeMap<TaskId, TaskSpec>,
}

impl WorkflowSpec {
    pub const API_VERSION: &'static str = "v1";

    pub fn new(output_task: impl Into<TaskId>) -> Self {
        Self {
            api_version: Self::API_VERSION.to_string(),
            output_task: output_task.into(),
            tasks: BTreeMap::new(),
        }
    }

    pub fn with_task(mut self, id: impl Into<TaskId>, spec: TaskSpec) -> Self {
        self.tasks.insert(id.into(), spec);
        self
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.tasks.keys()
    }

    /// Validates internal consistency: the output task exists, every
    /// `requires` edge points at a task in the graph, and the graph is
    /// acyclic. Returns the first problem found.
    pub fn validate(&self) -> Result<(), SpecValidationError> {
        if !self.tasks.contains_key(&self.output_task) {
            return Err(SpecValidationError::UnknownOutputTask(self.output_task.clone()));
        }
        for (id, task) in &self.tasks {
            for dep in task.requires.keys() {
                if !self.tasks.contains_key(dep) {
                    return Err(SpecValidationError::UnknownDependency {
                        task: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), SpecValidationError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: BTreeMap<&TaskId, Mark> = BTreeMap::new();

        fn visit<'a>(
            spec: &'a WorkflowSpec,
            id: &'a TaskId,
            marks: &mut BTreeMap<&'a TaskId, Mark>,
        ) -> Result<(), SpecValidationError> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(SpecValidationError::Cycle(id.clone())),
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            if let Some(task) = spec.tasks.get(id) {
                for dep in task.requires.keys() {
                    visit(spec, dep, marks)?;
                }
            }
            marks.insert(id, Mark::Done);
            Ok(())
        }

        for id in self.tasks.keys() {
            visit(self, id, &mut marks)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SpecValidationError {
    #[error("output task {0:?} is not defined")]
    UnknownOutputTask(TaskId),
    #[error("task {task:?} requires unknown task {dependency:?}")]
    UnknownDependency { task: TaskId, dependency: TaskId },
    #[error("dependency cycle detected at task {0:?}")]
    Cycle(TaskId),
}
