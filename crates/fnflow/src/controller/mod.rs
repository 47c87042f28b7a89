//! Tick-driven controllers: the part of the engine with a clock, retries,
//! and side effects.

pub mod invocation;
pub mod workflow;

pub use invocation::{InvocationController, InvocationControllerConfig};
pub use workflow::{WorkflowController, WorkflowControllerConfig};
