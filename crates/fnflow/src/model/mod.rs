//! The data model: specs (user intent), events (immutable facts), and
//! aggregates (folded state).

pub mod aggregate;
pub mod event;
pub mod spec;
pub mod status;
pub mod value;

pub use aggregate::{Aggregate, ApplyError, WorkflowAggregate, WorkflowInvocationAggregate};
pub use event::{AggregateRef, AggregateType, Event, EventPayload, InvocationEventPayload, WorkflowEventPayload};
pub use spec::{DependencyKind, DependencyParams, InputName, SpecValidationError, TaskId, TaskSpec, WorkflowSpec};
pub use status::{TaskInvocation, TaskInvocationStatus, WorkflowInvocationStatus, WorkflowStatus};
pub use value::{TypedValue, ValueType};
