//! Rolling per-actor action history used by the guard rails.
//!
//! The history is diagnostic only. It never decides task state; it only
//! feeds the repetition and thrashing checks.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::LazyLock;

use crate::core::invocation::{InvocationId, InvocationPayload};
use crate::core::task::{Priority, TaskId};

/// Default number of entries kept per actor.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// The party proposing invocations. Each task is its own actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl From<TaskId> for ActorId {
    fn from(id: TaskId) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for ActorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Collapse runs of whitespace and trim, so cosmetic edits do not change
/// an action's identity.
pub fn normalize(text: &str) -> String {
    WHITESPACE_RE.replace_all(text.trim(), " ").into_owned()
}

fn normalize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(normalize(s)),
        Value::Array(items) => Value::Array(items.iter().map(normalize_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// FNV-1a over the fields, with a separator byte so adjacent fields cannot
/// run together. Fixed constants keep fingerprints comparable across builds
/// and with checkpoints written by earlier runs.
struct Fnv1a(u64);

impl Fnv1a {
    const OFFSET: u64 = 14695981039346656037;
    const PRIME: u64 = 1099511628211;

    fn new() -> Self {
        Self(Self::OFFSET)
    }

    fn field(&mut self, bytes: &[u8]) -> &mut Self {
        for byte in bytes.iter().chain(std::iter::once(&0xff)) {
            self.0 ^= *byte as u64;
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
        self
    }
}

/// Stable hash of target delegate, subtask and normalized payload.
pub fn fingerprint(target: &str, payload: &InvocationPayload) -> u64 {
    let context = serde_json::to_string(&normalize_value(&payload.context)).unwrap_or_default();
    let mut hash = Fnv1a::new();
    hash.field(target.as_bytes())
        .field(payload.stage.as_bytes())
        .field(payload.subtask.as_bytes())
        .field(&[payload.priority.rank()])
        .field(normalize(&payload.description).as_bytes())
        .field(context.as_bytes());
    hash.0
}

/// How an issued action ended, filled in when the invocation closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryOutcome {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionHistoryEntry {
    pub fingerprint: u64,
    pub target: String,
    pub subtask: String,
    pub invocation_id: InvocationId,
    pub payload_bytes: usize,
    pub priority: Priority,
    pub outcome: EntryOutcome,
    pub at: DateTime<Utc>,
}

/// Bounded ring buffer of entries for every actor.
#[derive(Debug, Clone)]
pub struct ActionHistory {
    capacity: usize,
    actors: HashMap<ActorId, VecDeque<ActionHistoryEntry>>,
}

impl ActionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            actors: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, evicting the oldest once the actor is at capacity.
    pub fn record(&mut self, actor: &ActorId, entry: ActionHistoryEntry) {
        let ring = self.actors.entry(actor.clone()).or_default();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// Mark the entry issued for `invocation` as finished.
    pub fn set_outcome(
        &mut self,
        actor: &ActorId,
        invocation: InvocationId,
        outcome: EntryOutcome,
    ) -> bool {
        self.actors
            .get_mut(actor)
            .and_then(|ring| ring.iter_mut().rev().find(|e| e.invocation_id == invocation))
            .map(|entry| entry.outcome = outcome)
            .is_some()
    }

    /// Entries for an actor, oldest first.
    pub fn entries(&self, actor: &ActorId) -> Vec<&ActionHistoryEntry> {
        self.actors
            .get(actor)
            .map(|ring| ring.iter().collect())
            .unwrap_or_default()
    }

    pub fn last(&self, actor: &ActorId) -> Option<&ActionHistoryEntry> {
        self.actors.get(actor).and_then(|ring| ring.back())
    }

    /// The most recent `n` entries, oldest first.
    pub fn recent(&self, actor: &ActorId, n: usize) -> Vec<&ActionHistoryEntry> {
        let Some(ring) = self.actors.get(actor) else {
            return Vec::new();
        };
        ring.iter().skip(ring.len().saturating_sub(n)).collect()
    }

    /// The most recent `n` entries against `target`, oldest first.
    pub fn recent_for_target(
        &self,
        actor: &ActorId,
        target: &str,
        n: usize,
    ) -> Vec<&ActionHistoryEntry> {
        let mut found: Vec<&ActionHistoryEntry> = self
            .actors
            .get(actor)
            .map(|ring| ring.iter().rev().filter(|e| e.target == target).take(n).collect())
            .unwrap_or_default();
        found.reverse();
        found
    }

    pub fn len(&self, actor: &ActorId) -> usize {
        self.actors.get(actor).map(|r| r.len()).unwrap_or(0)
    }

    pub fn clear(&mut self, actor: &ActorId) {
        self.actors.remove(actor);
    }
}

impl Default for ActionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
