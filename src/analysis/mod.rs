//! Dependency analysis: which subtasks of a stage can run now, which must
//! wait, and which can never run without operator help.

pub mod analyzer;
pub mod graph;
pub mod plan;

pub use analyzer::{DependencyAnalyzer, StageAnalyzer};
pub use graph::SubtaskGraph;
pub use plan::{BlockReason, BlockingIssue, ExecutionPlan, PlannedSubtask};
