//! Uniform invocation of named delegates.
//!
//! `invoke` records the guard-rail history entry at issuance, spawns the
//! delegate call under a child cancellation token and a class timeout, and
//! either waits for it (sync) or hands back the queued record and delivers the
//! closed one later through a completion channel (async). A `WaveBarrier`
//! collects the completions of a parallel wave.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::invocation::{DelegateInvocation, ErrorKind, InvocationError, InvocationId};
use crate::delegate::registry::DelegateRegistry;
use crate::delegate::traits::{Delegate, DelegateClass};
use crate::error::Error;
use crate::guard::{ActionHistory, ActionHistoryEntry, ActorId, EntryOutcome, ProposedInvocation};
use crate::{clog_debug, clog_warn};

pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 30_000;

/// `[invoker]` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    pub default_timeout_ms: u64,
    pub team_timeout_ms: Option<u64>,
    pub worker_timeout_ms: Option<u64>,
    /// How long a cancelled wave may take to acknowledge.
    pub cancel_grace_ms: u64,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            team_timeout_ms: None,
            worker_timeout_ms: None,
            cancel_grace_ms: DEFAULT_CANCEL_GRACE_MS,
        }
    }
}

impl InvokerConfig {
    pub fn timeout_for(&self, class: DelegateClass) -> Duration {
        let ms = match class {
            DelegateClass::Team => self.team_timeout_ms,
            DelegateClass::Worker => self.worker_timeout_ms,
        };
        Duration::from_millis(ms.unwrap_or(self.default_timeout_ms))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// Block the caller until the invocation closes.
    Sync,
    /// Return the queued record; the closed record arrives on the completion channel.
    Async,
}

/// Receives every invocation once it has closed.
pub type CompletionSender = mpsc::UnboundedSender<DelegateInvocation>;

pub struct DelegateInvoker {
    registry: Arc<DelegateRegistry>,
    history: Arc<RwLock<ActionHistory>>,
    config: InvokerConfig,
}

impl DelegateInvoker {
    pub fn new(
        registry: Arc<DelegateRegistry>,
        history: Arc<RwLock<ActionHistory>>,
        config: InvokerConfig,
    ) -> Self {
        Self {
            registry,
            history,
            config,
        }
    }

    pub fn registry(&self) -> &DelegateRegistry {
        &self.registry
    }

    pub fn history(&self) -> &Arc<RwLock<ActionHistory>> {
        &self.history
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    /// Issue an approved proposal.
    ///
    /// Exactly one history entry is appended for `actor` before the delegate
    /// is called. Cancelling `parent` cancels this invocation; a timeout only
    /// affects this invocation.
    pub async fn invoke(
        &self,
        actor: &ActorId,
        proposal: ProposedInvocation,
        mode: InvocationMode,
        parent: &CancellationToken,
        on_complete: Option<CompletionSender>,
    ) -> DelegateInvocation {
        let issued = self.issue(actor, proposal, parent, on_complete).await;
        match mode {
            InvocationMode::Async => issued.record,
            InvocationMode::Sync => issued.join().await,
        }
    }

    /// Record and spawn the call without waiting for it.
    ///
    /// The returned record is still queued, so callers can persist it before
    /// the delegate answers.
    pub async fn issue(
        &self,
        actor: &ActorId,
        proposal: ProposedInvocation,
        parent: &CancellationToken,
        on_complete: Option<CompletionSender>,
    ) -> IssuedInvocation {
        let ProposedInvocation {
            target,
            payload,
            fingerprint,
        } = proposal;
        let invocation = DelegateInvocation::new(&target, payload, fingerprint);

        self.history.write().await.record(
            actor,
            ActionHistoryEntry {
                fingerprint,
                target: target.clone(),
                subtask: invocation.subtask.clone(),
                invocation_id: invocation.id,
                payload_bytes: invocation.payload.byte_len(),
                priority: invocation.payload.priority,
                outcome: EntryOutcome::Pending,
                at: invocation.created_at,
            },
        );

        let delegate = self.registry.get(&target);
        let timeout = delegate
            .as_ref()
            .map(|d| self.config.timeout_for(d.class()))
            .unwrap_or_else(|| Duration::from_millis(self.config.default_timeout_ms));

        clog_debug!(
            "Issuing invocation {} -> {} (subtask {}, fp {:016x}, timeout {:?})",
            invocation.id.short(),
            target,
            invocation.subtask,
            fingerprint,
            timeout
        );

        let record = invocation.clone();
        let run = Run {
            delegate,
            invocation,
            timeout,
            token: parent.child_token(),
            history: self.history.clone(),
            actor: actor.clone(),
            notify: on_complete,
        };
        IssuedInvocation {
            record,
            handle: tokio::spawn(run.execute()),
        }
    }
}

/// A spawned invocation: its queued record and the handle that yields the
/// closed one.
pub struct IssuedInvocation {
    pub record: DelegateInvocation,
    handle: JoinHandle<DelegateInvocation>,
}

impl IssuedInvocation {
    /// Wait for the invocation to close.
    pub async fn join(self) -> DelegateInvocation {
        match self.handle.await {
            Ok(closed) => closed,
            Err(e) => {
                let mut failed = self.record;
                let _ = failed.fail(InvocationError::new(
                    ErrorKind::DelegateError,
                    format!("invocation task aborted: {}", e),
                ));
                failed
            }
        }
    }
}

/// One spawned delegate call.
struct Run {
    delegate: Option<Arc<dyn Delegate>>,
    invocation: DelegateInvocation,
    timeout: Duration,
    token: CancellationToken,
    history: Arc<RwLock<ActionHistory>>,
    actor: ActorId,
    notify: Option<CompletionSender>,
}

impl Run {
    async fn execute(self) -> DelegateInvocation {
        let Run {
            delegate,
            mut invocation,
            timeout,
            token,
            history,
            actor,
            notify,
        } = self;

        let outcome = match delegate {
            None => Err(InvocationError::new(
                ErrorKind::UnknownDelegate,
                Error::DelegateNotFound(invocation.delegate.clone()).to_string(),
            )),
            Some(delegate) => {
                let _ = invocation.start();
                let call = AssertUnwindSafe(delegate.execute(&invocation.payload)).catch_unwind();
                tokio::select! {
                    _ = token.cancelled() => Err(InvocationError::new(
                        ErrorKind::Cancelled,
                        "cancelled before completion",
                    )),
                    res = tokio::time::timeout(timeout, call) => match res {
                        Err(_) => Err(InvocationError::new(
                            ErrorKind::Timeout,
                            Error::InvocationTimeout(timeout).to_string(),
                        )),
                        Ok(Err(_)) => Err(InvocationError::new(
                            ErrorKind::DelegateError,
                            "delegate panicked",
                        )),
                        Ok(Ok(Err(e))) => Err(InvocationError::new(
                            ErrorKind::DelegateError,
                            e.to_string(),
                        )),
                        Ok(Ok(Ok(response))) if response.success => Ok(response),
                        Ok(Ok(Ok(response))) => Err(InvocationError::new(
                            ErrorKind::DelegateError,
                            response
                                .error
                                .unwrap_or_else(|| "delegate reported failure".to_string()),
                        )),
                    },
                }
            }
        };

        let entry_outcome = match outcome {
            Ok(response) => {
                let _ = invocation.succeed(response.result, response.sub_score);
                EntryOutcome::Succeeded
            }
            Err(error) => {
                clog_warn!(
                    "Invocation {} -> {} failed: {}",
                    invocation.id.short(),
                    invocation.delegate,
                    error
                );
                let _ = invocation.fail(error);
                EntryOutcome::Failed
            }
        };
        history
            .write()
            .await
            .set_outcome(&actor, invocation.id, entry_outcome);

        clog_debug!(
            "Invocation {} closed as {}",
            invocation.id.short(),
            invocation.status
        );
        if let Some(tx) = notify {
            let _ = tx.send(invocation.clone());
        }
        invocation
    }
}

/// All-complete barrier for a wave of async invocations.
///
/// Completions that arrive early are visible through `completed()` but the
/// barrier is only satisfied once every issued invocation has closed.
/// `wait` is cancel-safe: a completion received before the wait is dropped
/// is kept for the next call.
pub struct WaveBarrier {
    issued: Vec<DelegateInvocation>,
    completed: Vec<DelegateInvocation>,
    tx: CompletionSender,
    rx: mpsc::UnboundedReceiver<DelegateInvocation>,
}

impl WaveBarrier {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            issued: Vec::new(),
            completed: Vec::new(),
            tx,
            rx,
        }
    }

    /// Completion channel to pass to `invoke`.
    pub fn sender(&self) -> CompletionSender {
        self.tx.clone()
    }

    /// Register an issued invocation the barrier must wait for.
    pub fn track(&mut self, invocation: DelegateInvocation) {
        self.issued.push(invocation);
    }

    pub fn issued(&self) -> &[DelegateInvocation] {
        &self.issued
    }

    /// Closed invocations so far, in completion order.
    pub fn completed(&self) -> &[DelegateInvocation] {
        &self.completed
    }

    pub fn outstanding(&self) -> Vec<InvocationId> {
        self.issued
            .iter()
            .filter(|i| !self.completed.iter().any(|c| c.id == i.id))
            .map(|i| i.id)
            .collect()
    }

    pub fn is_satisfied(&self) -> bool {
        self.outstanding().is_empty()
    }

    /// Wait until every tracked invocation has closed.
    pub async fn wait(&mut self) {
        while !self.is_satisfied() {
            match self.rx.recv().await {
                Some(closed) => {
                    if self.issued.iter().any(|i| i.id == closed.id)
                        && !self.completed.iter().any(|c| c.id == closed.id)
                    {
                        self.completed.push(closed);
                    }
                }
                None => break,
            }
        }
    }

    /// Closed invocations in completion order.
    pub fn into_completed(self) -> Vec<DelegateInvocation> {
        self.completed
    }
}

impl Default for WaveBarrier {
    fn default() -> Self {
        Self::new()
    }
}
