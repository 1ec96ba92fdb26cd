use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already exists: {0}")]
    TaskExists(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invocation {id} cannot move from {from} to {to}")]
    InvalidInvocationTransition { id: String, from: String, to: String },

    #[error("Dependency blocked: {0}")]
    DependencyBlocked(String),

    #[error("Guard rail rejected dispatch: {0}")]
    GuardRailRejected(String),

    #[error("Invocation timed out after {0:?}")]
    InvocationTimeout(std::time::Duration),

    #[error("Invocation failed: {0}")]
    InvocationFailed(String),

    #[error("Quality below threshold: score {score:.2} < {threshold:.2}")]
    QualityBelowThreshold { score: f64, threshold: f64 },

    #[error("Checkpoint write failed: {0}")]
    CheckpointWriteFailed(String),

    #[error("Checkpoint sequence gap for task {task}: expected {expected}, got {got}")]
    CheckpointSequence { task: String, expected: u64, got: u64 },

    #[error("Dependency analyzer fault: {0}")]
    InternalAnalyzerError(String),

    #[error("Quality gate fault: {0}")]
    InternalGateError(String),

    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("Delegate not registered: {0}")]
    DelegateNotFound(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Task {0} already has an active driver")]
    DriverBusy(String),
}

impl Error {
    /// Internal engine faults are surfaced, never retried.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::InternalAnalyzerError(_) | Error::InternalGateError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
