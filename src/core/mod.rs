//! Core domain models for the coordination engine.
//!
//! Tasks, the stage pipeline they move through, the invocations dispatched on
//! their behalf, and the quality verdicts rendered over each stage.

pub mod invocation;
pub mod pipeline;
pub mod task;
pub mod verdict;

pub use invocation::{
    DelegateInvocation, ErrorKind, InvocationError, InvocationId, InvocationPayload,
    InvocationStatus,
};
pub use pipeline::{Pipeline, StageSpec, SubtaskSpec};
pub use task::{Priority, StageTransition, SubtaskResult, Task, TaskId, TaskStatus};
pub use verdict::{Decision, QualityVerdict};
