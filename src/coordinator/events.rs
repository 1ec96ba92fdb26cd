//! Ordered event stream for presentation and telemetry consumers.
//!
//! Events are fire-and-forget: publishing with no subscribers is not an
//! error, and a lagging subscriber loses the oldest events, never the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::invocation::{InvocationId, InvocationStatus};
use crate::core::task::{TaskId, TaskStatus};
use crate::core::verdict::Decision;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EventKind {
    StageStarted {
        stage: String,
        revision: u32,
    },
    InvocationIssued {
        invocation_id: InvocationId,
        delegate: String,
        subtask: String,
    },
    InvocationCompleted {
        invocation_id: InvocationId,
        subtask: String,
        status: InvocationStatus,
        error: Option<String>,
    },
    InvocationRejected {
        delegate: String,
        subtask: String,
        reasons: Vec<String>,
    },
    VerdictRendered {
        stage: String,
        score: f64,
        decision: Decision,
    },
    StatusChanged {
        from: TaskStatus,
        to: TaskStatus,
    },
    HumanReviewRequested {
        reason: String,
    },
    TaskCompleted,
    TaskFailed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub task_id: TaskId,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(task_id: TaskId, kind: EventKind) -> Self {
        Self {
            task_id,
            kind,
            at: Utc::now(),
        }
    }
}

/// In-process fan-out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, task_id: TaskId, kind: EventKind) {
        // No receivers is fine.
        let _ = self.tx.send(Event::new(task_id, kind));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
