pub mod config;
pub mod error;
pub mod log;

// Domain model and the stage pipeline
pub mod core;

// Coordination building blocks
pub mod analysis;
pub mod checkpoint;
pub mod delegate;
pub mod guard;
pub mod quality;

// Per-task driver and the public engine
pub mod coordinator;

pub use config::Config;
pub use coordinator::{
    Engine, EngineBuilder, Event, EventKind, ReviewAction, ReviewDecision, ReviewPackage,
    StatusReport, TaskRequest,
};
pub use crate::core::{Pipeline, Priority, StageSpec, SubtaskSpec, TaskId, TaskStatus};
pub use error::{Error, Result};
