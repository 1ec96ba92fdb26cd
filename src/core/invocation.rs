//! Delegate invocation records.
//!
//! One invocation is created per dispatched unit of work. Its status moves
//! Queued -> Executing -> {Succeeded, Failed} exactly once; a retry creates a
//! fresh record with a new id instead of reopening a closed one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::task::Priority;
use crate::error::{Error, Result};

/// Unique identifier for a delegate invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(pub Uuid);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    #[default]
    Queued,
    Executing,
    Succeeded,
    Failed,
}

impl InvocationStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, InvocationStatus::Succeeded | InvocationStatus::Failed)
    }
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationStatus::Queued => write!(f, "queued"),
            InvocationStatus::Executing => write!(f, "executing"),
            InvocationStatus::Succeeded => write!(f, "succeeded"),
            InvocationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why an invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The delegate did not answer within its class timeout.
    Timeout,
    /// The delegate answered with `success: false` or raised an error.
    DelegateError,
    /// No delegate is registered under the target name.
    UnknownDelegate,
    /// Cancelled by a task-level cancellation request.
    Cancelled,
    /// Left open by a coordinator that stopped before it could close it.
    Interrupted,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::DelegateError => write!(f, "delegate_error"),
            ErrorKind::UnknownDelegate => write!(f, "unknown_delegate"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl InvocationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for InvocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Input handed to a delegate's `execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationPayload {
    pub description: String,
    pub priority: Priority,
    pub stage: String,
    pub subtask: String,
    /// Task context plus upstream results, attempt and revision feedback.
    pub context: Value,
}

impl InvocationPayload {
    /// Serialized size, used by the payload size limit and escalation checks.
    pub fn byte_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// A single dispatched unit of work and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateInvocation {
    pub id: InvocationId,
    pub delegate: String,
    pub stage: String,
    pub subtask: String,
    pub payload: InvocationPayload,
    pub status: InvocationStatus,
    pub result: Option<Value>,
    pub sub_score: Option<f64>,
    pub error: Option<InvocationError>,
    /// Guard-rail fingerprint recorded at issuance.
    pub fingerprint: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DelegateInvocation {
    pub fn new(delegate: &str, payload: InvocationPayload, fingerprint: u64) -> Self {
        Self {
            id: InvocationId::new(),
            delegate: delegate.to_string(),
            stage: payload.stage.clone(),
            subtask: payload.subtask.clone(),
            payload,
            status: InvocationStatus::Queued,
            result: None,
            sub_score: None,
            error: None,
            fingerprint,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    fn invalid(&self, to: InvocationStatus) -> Error {
        Error::InvalidInvocationTransition {
            id: self.id.to_string(),
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    /// Queued -> Executing.
    pub fn start(&mut self) -> Result<()> {
        if self.status != InvocationStatus::Queued {
            return Err(self.invalid(InvocationStatus::Executing));
        }
        self.status = InvocationStatus::Executing;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Executing -> Succeeded.
    pub fn succeed(&mut self, result: Value, sub_score: Option<f64>) -> Result<()> {
        if self.status != InvocationStatus::Executing {
            return Err(self.invalid(InvocationStatus::Succeeded));
        }
        self.status = InvocationStatus::Succeeded;
        self.result = Some(result);
        self.sub_score = sub_score;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Queued or Executing -> Failed.
    ///
    /// A queued invocation may fail directly when it is cancelled or
    /// interrupted before it ever started.
    pub fn fail(&mut self, error: InvocationError) -> Result<()> {
        if self.status.is_closed() {
            return Err(self.invalid(InvocationStatus::Failed));
        }
        self.status = InvocationStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    pub fn succeeded(&self) -> bool {
        self.status == InvocationStatus::Succeeded
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
