//! The per-task driver: one coordination step at a time, each step holding
//! the task's lock except while it waits on delegates or backoff.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::analysis::{DependencyAnalyzer, ExecutionPlan, PlannedSubtask};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::coordinator::events::{EventBus, EventKind};
use crate::coordinator::retry::RetryConfig;
use crate::coordinator::state::{Blocker, CoordinationState};
use crate::coordinator::synthesis::Synthesizer;
use crate::core::invocation::{DelegateInvocation, ErrorKind, InvocationId, InvocationPayload};
use crate::core::task::{SubtaskResult, TaskId, TaskStatus};
use crate::core::verdict::Decision;
use crate::delegate::{DelegateInvoker, InvocationMode, WaveBarrier};
use crate::error::{Error, Result};
use crate::guard::{ActorId, GuardRailEvaluator, ProposedInvocation};
use crate::quality::QualityGate;
use crate::{clog, clog_debug, clog_error, clog_warn};

/// What the driver will do next from a given state.
///
/// Derived only from the serialized state, so a task resumed from a
/// checkpoint takes the same next action an uninterrupted run would.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum NextAction {
    Start,
    Plan { stage: String },
    Dispatch { stage: String, subtasks: Vec<String> },
    AwaitWave { outstanding: Vec<InvocationId> },
    CollectWave { invocations: Vec<InvocationId> },
    Evaluate { stage: String, revision: u32 },
    PlanNextWave { stage: String },
    Backoff { attempt: u32 },
    Synthesize,
    AwaitOperator { reason: Option<String> },
    Done { status: TaskStatus },
}

pub fn next_action(state: &CoordinationState) -> NextAction {
    let task = &state.task;
    let stage = task.current_stage_name().to_string();
    match task.status {
        TaskStatus::Pending => NextAction::Start,
        TaskStatus::Planning => NextAction::Plan { stage },
        TaskStatus::Dispatching => NextAction::Dispatch {
            stage,
            subtasks: state
                .plan
                .as_ref()
                .map(|p| p.parallel.iter().map(|s| s.name.clone()).collect())
                .unwrap_or_default(),
        },
        TaskStatus::AwaitingResults => {
            let outstanding: Vec<InvocationId> = state
                .wave_invocations()
                .into_iter()
                .filter(|i| !i.is_closed())
                .map(|i| i.id)
                .collect();
            if outstanding.is_empty() {
                NextAction::CollectWave {
                    invocations: state.wave.clone(),
                }
            } else {
                NextAction::AwaitWave { outstanding }
            }
        }
        TaskStatus::QualityCheck if task.current_stage_complete() => NextAction::Evaluate {
            revision: task.revisions_used(&stage),
            stage,
        },
        TaskStatus::QualityCheck => NextAction::PlanNextWave { stage },
        TaskStatus::Retrying => NextAction::Backoff {
            attempt: task.stage_retries,
        },
        TaskStatus::Synthesizing => NextAction::Synthesize,
        TaskStatus::HumanReview | TaskStatus::Escalated => NextAction::AwaitOperator {
            reason: task.blocking_reason.clone(),
        },
        TaskStatus::Completed | TaskStatus::Failed => NextAction::Done {
            status: task.status,
        },
    }
}

/// Payload for one planned subtask.
///
/// Carries the caller context, upstream results the subtask depends on,
/// the attempt and revision counters, the latest verdict findings while
/// revising, and the previous error when the last attempt failed.
pub fn build_payload(state: &CoordinationState, subtask: &PlannedSubtask) -> InvocationPayload {
    let task = &state.task;
    let stage = task.current_stage_name();
    let revision = task.revisions_used(stage);

    let mut upstream = Map::new();
    for dependency in &subtask.depends_on {
        if let Some(result) = task.results.get(dependency) {
            upstream.insert(dependency.clone(), result.payload.clone());
        }
    }

    let mut context = Map::new();
    context.insert("input".to_string(), task.context.clone());
    context.insert("upstream".to_string(), Value::Object(upstream));
    context.insert("attempt".to_string(), json!(task.stage_retries));
    context.insert("revision".to_string(), json!(revision));
    if revision > 0 {
        if let Some(verdict) = state.verdicts_for(stage).last() {
            context.insert("feedback".to_string(), json!(verdict.findings));
        }
    }
    if let Some(error) = state
        .last_attempt(&subtask.name)
        .and_then(|i| i.error.as_ref())
    {
        context.insert("previous_error".to_string(), json!(error.to_string()));
    }

    InvocationPayload {
        description: task.description.clone(),
        priority: task.priority,
        stage: stage.to_string(),
        subtask: subtask.name.clone(),
        context: Value::Object(context),
    }
}

/// Mutable per-task state guarded by the task lock.
pub(crate) struct TaskRuntime {
    pub state: CoordinationState,
    /// Sequence of the last checkpoint written.
    pub sequence: u64,
    /// Live barrier for the wave in flight; never persisted.
    pub barrier: Option<WaveBarrier>,
    pub cancel: CancellationToken,
}

impl TaskRuntime {
    pub fn new(state: CoordinationState, sequence: u64) -> Self {
        Self {
            state,
            sequence,
            barrier: None,
            cancel: CancellationToken::new(),
        }
    }
}

pub(crate) struct TaskSlot {
    pub runtime: Mutex<TaskRuntime>,
    /// Set while a driver is stepping this task. Changed only under the lock.
    pub driving: AtomicBool,
    /// `Some(status)` once the driver has stopped.
    pub stopped: watch::Sender<Option<TaskStatus>>,
}

impl TaskSlot {
    pub fn new(runtime: TaskRuntime) -> Self {
        let (stopped, _) = watch::channel(None);
        Self {
            runtime: Mutex::new(runtime),
            driving: AtomicBool::new(false),
            stopped,
        }
    }
}

/// Everything the driver consults, shared by every task.
pub(crate) struct Services {
    pub analyzer: Arc<dyn DependencyAnalyzer>,
    pub evaluator: GuardRailEvaluator,
    pub invoker: DelegateInvoker,
    pub gate: QualityGate,
    pub store: Arc<dyn CheckpointStore>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub events: EventBus,
    pub retry: RetryConfig,
}

/// Start a driver for `slot` unless one is already running.
///
/// Must be called with the slot's runtime lock held by the caller, passed
/// in as `rt`, so the `driving` flag and the stop signal stay consistent.
pub(crate) fn spawn_driver(
    services: &Arc<Services>,
    slot: &Arc<TaskSlot>,
    rt: &TaskRuntime,
) -> Result<()> {
    if slot.driving.swap(true, Ordering::SeqCst) {
        return Err(Error::DriverBusy(rt.state.task.id.to_string()));
    }
    slot.stopped.send_replace(None);
    tokio::spawn(drive(services.clone(), slot.clone()));
    Ok(())
}

async fn drive(services: Arc<Services>, slot: Arc<TaskSlot>) {
    loop {
        match services.step(&slot).await {
            Ok(true) => continue,
            Ok(false) => break,
            Err(Error::CheckpointWriteFailed(_)) => break,
            Err(e) => {
                clog_error!("Driver step failed: {}", e);
                let mut rt = slot.runtime.lock().await;
                if rt.state.status().is_active() {
                    let _ = services
                        .escalate(&mut rt, Blocker::Internal { error: e.to_string() })
                        .await;
                }
                break;
            }
        }
    }

    let rt = slot.runtime.lock().await;
    let status = rt.state.status();
    slot.driving.store(false, Ordering::SeqCst);
    slot.stopped.send_replace(Some(status));
    clog_debug!("Driver for task {} stopped at {}", rt.state.task.id.short(), status);
}

/// `Ok(true)` means keep stepping; `Ok(false)` means the task parked or
/// finished.
type Step = Result<bool>;

impl Services {
    async fn step(&self, slot: &Arc<TaskSlot>) -> Step {
        let mut rt = slot.runtime.lock().await;
        let token = rt.cancel.clone();
        if token.is_cancelled() && rt.state.status().is_active() {
            self.finish_cancel(&mut rt).await?;
            return Ok(false);
        }

        match rt.state.status() {
            TaskStatus::Pending => self.start(&mut rt).await,
            TaskStatus::Planning => self.plan(&mut rt).await,
            TaskStatus::Dispatching => self.dispatch(slot, rt, token).await,
            TaskStatus::AwaitingResults => self.await_results(slot, rt, token).await,
            TaskStatus::QualityCheck => self.quality_check(&mut rt).await,
            TaskStatus::Retrying => self.backoff(slot, rt, token).await,
            TaskStatus::Synthesizing => self.synthesize(&mut rt).await,
            TaskStatus::HumanReview
            | TaskStatus::Escalated
            | TaskStatus::Completed
            | TaskStatus::Failed => Ok(false),
        }
    }

    /// Append the current state as the next checkpoint.
    ///
    /// A failed write is fatal: the task is marked Failed in memory and one
    /// best-effort attempt is made to record that.
    pub(crate) async fn commit(&self, rt: &mut TaskRuntime) -> Result<()> {
        let task_id = rt.state.task.id;
        let next = rt.sequence + 1;
        match self
            .store
            .append(task_id, Checkpoint::new(next, rt.state.clone()))
            .await
        {
            Ok(sequence) => {
                rt.sequence = sequence;
                Ok(())
            }
            Err(e) => {
                clog_error!(
                    "Checkpoint {} for task {} failed: {}",
                    next,
                    task_id.short(),
                    e
                );
                let from = rt.state.status();
                if !from.is_terminal() {
                    rt.state.block(Blocker::CheckpointFailure {
                        error: e.to_string(),
                    });
                    if rt
                        .state
                        .transition(TaskStatus::Failed, Some("checkpoint write failed".to_string()))
                        .is_ok()
                    {
                        self.events.publish(
                            task_id,
                            EventKind::StatusChanged {
                                from,
                                to: TaskStatus::Failed,
                            },
                        );
                        self.events.publish(
                            task_id,
                            EventKind::TaskFailed {
                                reason: e.to_string(),
                            },
                        );
                    }
                    if let Ok(sequence) = self
                        .store
                        .append(task_id, Checkpoint::new(next, rt.state.clone()))
                        .await
                    {
                        rt.sequence = sequence;
                    }
                }
                Err(Error::CheckpointWriteFailed(e.to_string()))
            }
        }
    }

    /// Transition, log, publish, then checkpoint.
    pub(crate) async fn advance(
        &self,
        rt: &mut TaskRuntime,
        to: TaskStatus,
        reason: impl Into<String>,
    ) -> Result<()> {
        let from = rt.state.status();
        let reason = reason.into();
        rt.state.transition(to, Some(reason.clone()))?;
        clog!(
            "Task {} {} -> {} [{}]: {}",
            rt.state.task.id.short(),
            from,
            to,
            rt.state.task.current_stage_name(),
            reason
        );
        self.events
            .publish(rt.state.task.id, EventKind::StatusChanged { from, to });
        self.commit(rt).await
    }

    pub(crate) async fn escalate(&self, rt: &mut TaskRuntime, blocker: Blocker) -> Result<()> {
        clog_warn!("Task {} escalated: {}", rt.state.task.id.short(), blocker);
        let reason = blocker.to_string();
        rt.state.block(blocker);
        self.advance(rt, TaskStatus::Escalated, reason).await
    }

    async fn park_for_review(&self, rt: &mut TaskRuntime, blocker: Blocker, reason: String) -> Result<()> {
        rt.state.block(blocker);
        self.advance(rt, TaskStatus::HumanReview, reason.clone()).await?;
        self.events
            .publish(rt.state.task.id, EventKind::HumanReviewRequested { reason });
        Ok(())
    }

    fn stage_started(&self, rt: &TaskRuntime) {
        let task = &rt.state.task;
        let stage = task.current_stage_name().to_string();
        self.events.publish(
            task.id,
            EventKind::StageStarted {
                revision: task.revisions_used(&stage),
                stage,
            },
        );
    }

    async fn finish_cancel(&self, rt: &mut TaskRuntime) -> Result<()> {
        let closed = rt
            .state
            .close_open_invocations(ErrorKind::Cancelled, "task cancelled");
        rt.barrier = None;
        rt.state.wave.clear();
        if closed > 0 {
            clog_warn!(
                "Task {}: {} invocation(s) did not acknowledge cancellation in time",
                rt.state.task.id.short(),
                closed
            );
        }
        self.escalate(rt, Blocker::Cancelled).await
    }

    async fn start(&self, rt: &mut TaskRuntime) -> Step {
        self.advance(rt, TaskStatus::Planning, "accepted").await?;
        self.stage_started(rt);
        Ok(true)
    }

    /// Run the analyzer and store the result as the active plan.
    ///
    /// `Ok(None)` means the analyzer faulted and the task was escalated.
    async fn replan(&self, rt: &mut TaskRuntime) -> Result<Option<ExecutionPlan>> {
        match self.analyzer.analyze(&rt.state.task, &rt.state.task.results) {
            Ok(plan) => {
                clog_debug!(
                    "Task {} plan for {}: parallel={:?} sequential={:?} blocked={}",
                    rt.state.task.id.short(),
                    plan.stage,
                    plan.parallel.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
                    plan.sequential.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
                    plan.blocking_issues.len()
                );
                rt.state.plan = Some(plan.clone());
                Ok(Some(plan))
            }
            Err(e) => {
                self.escalate(rt, Blocker::Internal { error: e.to_string() })
                    .await?;
                Ok(None)
            }
        }
    }

    /// Move to Dispatching with `plan`, or park if it is blocked.
    async fn route_plan(&self, rt: &mut TaskRuntime, plan: ExecutionPlan, reason: String) -> Step {
        if plan.is_blocked() {
            let summary = plan.blocking_summary();
            let error = Error::DependencyBlocked(summary.clone());
            self.park_for_review(
                rt,
                Blocker::DependencyBlocked {
                    stage: plan.stage.clone(),
                    issues: summary,
                },
                error.to_string(),
            )
            .await?;
            return Ok(false);
        }
        self.advance(rt, TaskStatus::Dispatching, reason).await?;
        Ok(true)
    }

    async fn plan(&self, rt: &mut TaskRuntime) -> Step {
        let Some(plan) = self.replan(rt).await? else {
            return Ok(false);
        };
        let reason = format!("{} subtask(s) ready", plan.parallel.len());
        self.route_plan(rt, plan, reason).await
    }

    /// Retry if the stage budget allows, otherwise escalate.
    async fn after_failure(&self, rt: &mut TaskRuntime, detail: String) -> Step {
        let used = rt.state.task.stage_retries;
        if self.retry.has_budget(used) {
            rt.state.task.stage_retries = used + 1;
            let reason = format!(
                "retry {}/{}: {}",
                used + 1,
                self.retry.max_retries_per_stage,
                detail
            );
            self.advance(rt, TaskStatus::Retrying, reason).await?;
            Ok(true)
        } else {
            let stage = rt.state.task.current_stage_name().to_string();
            self.escalate(
                rt,
                Blocker::RetriesExhausted {
                    stage,
                    last_error: detail,
                },
            )
            .await?;
            Ok(false)
        }
    }

    async fn dispatch(
        &self,
        slot: &Arc<TaskSlot>,
        mut rt: MutexGuard<'_, TaskRuntime>,
        token: CancellationToken,
    ) -> Step {
        let task_id = rt.state.task.id;
        let actor = ActorId::from(task_id);
        let planned = rt
            .state
            .plan
            .as_ref()
            .map(|p| p.parallel.clone())
            .unwrap_or_default();
        let proposals: Vec<ProposedInvocation> = planned
            .iter()
            .map(|p| ProposedInvocation::new(&p.delegate, build_payload(&rt.state, p)))
            .collect();
        rt.state.wave.clear();

        if proposals.is_empty() {
            self.advance(&mut rt, TaskStatus::AwaitingResults, "nothing left to dispatch")
                .await?;
            return Ok(true);
        }

        let rejections: Vec<(ProposedInvocation, String)> = {
            let history = self.invoker.history().read().await;
            proposals
                .iter()
                .filter_map(|p| {
                    let verdict = self.evaluator.check(&actor, p, &history);
                    (!verdict.approved).then(|| (p.clone(), verdict.summary()))
                })
                .collect()
        };
        if !rejections.is_empty() {
            let mut details = Vec::new();
            for (proposal, summary) in rejections {
                let error = Error::GuardRailRejected(summary.clone());
                clog_warn!(
                    "Task {}: {} -> {} {}",
                    task_id.short(),
                    proposal.payload.subtask,
                    proposal.target,
                    error
                );
                rt.state.task.note(format!(
                    "{} -> {}: {}",
                    proposal.payload.subtask, proposal.target, error
                ));
                self.events.publish(
                    task_id,
                    EventKind::InvocationRejected {
                        delegate: proposal.target.clone(),
                        subtask: proposal.payload.subtask.clone(),
                        reasons: vec![summary.clone()],
                    },
                );
                details.push(format!("{}: {}", proposal.payload.subtask, summary));
            }
            return self.after_failure(&mut rt, details.join("; ")).await;
        }

        if proposals.len() == 1 {
            let proposal = proposals.into_iter().next().ok_or_else(|| {
                Error::Validation("empty wave".to_string())
            })?;
            // Sync wave: the record is checkpointed before the call is awaited.
            let issued = self.invoker.issue(&actor, proposal, &token, None).await;
            let mut record = issued.record.clone();
            self.publish_issued(task_id, &record);
            record.start()?;
            rt.state.wave = vec![record.id];
            rt.state.upsert_invocation(record);
            self.advance(&mut rt, TaskStatus::AwaitingResults, "1 invocation issued")
                .await?;
            drop(rt);

            let closed = issued.join().await;
            let mut rt = slot.runtime.lock().await;
            self.publish_completed(task_id, &closed);
            rt.state.upsert_invocation(closed);
            return Ok(true);
        }

        let mut barrier = WaveBarrier::new();
        for proposal in proposals {
            let mut record = self
                .invoker
                .invoke(
                    &actor,
                    proposal,
                    InvocationMode::Async,
                    &token,
                    Some(barrier.sender()),
                )
                .await;
            self.publish_issued(task_id, &record);
            barrier.track(record.clone());
            record.start()?;
            rt.state.wave.push(record.id);
            rt.state.upsert_invocation(record);
        }
        let issued = barrier.issued().len();
        rt.barrier = Some(barrier);
        self.advance(
            &mut rt,
            TaskStatus::AwaitingResults,
            format!("{} invocations issued", issued),
        )
        .await?;
        Ok(true)
    }

    fn publish_issued(&self, task_id: TaskId, invocation: &DelegateInvocation) {
        self.events.publish(
            task_id,
            EventKind::InvocationIssued {
                invocation_id: invocation.id,
                delegate: invocation.delegate.clone(),
                subtask: invocation.subtask.clone(),
            },
        );
    }

    fn publish_completed(&self, task_id: TaskId, invocation: &DelegateInvocation) {
        self.events.publish(
            task_id,
            EventKind::InvocationCompleted {
                invocation_id: invocation.id,
                subtask: invocation.subtask.clone(),
                status: invocation.status,
                error: invocation.error.as_ref().map(|e| e.to_string()),
            },
        );
    }

    async fn await_results(
        &self,
        slot: &Arc<TaskSlot>,
        mut rt: MutexGuard<'_, TaskRuntime>,
        token: CancellationToken,
    ) -> Step {
        let Some(mut barrier) = rt.barrier.take() else {
            return self.collect_wave(&mut rt).await;
        };
        drop(rt);

        let cancelled = tokio::select! {
            _ = barrier.wait() => false,
            _ = token.cancelled() => true,
        };
        if cancelled {
            // Child tokens are already cancelled; give them the grace period.
            let grace = self.invoker.config().cancel_grace();
            if tokio::time::timeout(grace, barrier.wait()).await.is_err() {
                clog_warn!(
                    "{} invocation(s) still running after {:?} grace",
                    barrier.outstanding().len(),
                    grace
                );
            }
        }

        let mut rt = slot.runtime.lock().await;
        let task_id = rt.state.task.id;
        for closed in barrier.into_completed() {
            self.publish_completed(task_id, &closed);
            rt.state.upsert_invocation(closed);
        }
        if cancelled {
            self.finish_cancel(&mut rt).await?;
            return Ok(false);
        }
        self.collect_wave(&mut rt).await
    }

    /// Fold the closed wave into task results and decide what follows.
    async fn collect_wave(&self, rt: &mut TaskRuntime) -> Step {
        let wave: Vec<DelegateInvocation> = rt
            .state
            .wave_invocations()
            .into_iter()
            .cloned()
            .collect();
        rt.state.wave.clear();

        let mut failures = Vec::new();
        for invocation in wave {
            if invocation.succeeded() {
                let result = SubtaskResult {
                    stage: invocation.stage.clone(),
                    delegate: invocation.delegate.clone(),
                    invocation_id: Some(invocation.id),
                    payload: invocation.result.clone().unwrap_or(Value::Null),
                    sub_score: invocation.sub_score,
                    completed_at: invocation.finished_at.unwrap_or(invocation.created_at),
                };
                rt.state.task.record_result(&invocation.subtask, result);
            } else {
                let error = match &invocation.error {
                    Some(e) => Error::InvocationFailed(e.to_string()),
                    None => Error::InvocationFailed("did not close".to_string()),
                };
                failures.push(format!("{}: {}", invocation.subtask, error));
            }
        }

        if failures.is_empty() {
            self.advance(rt, TaskStatus::QualityCheck, "wave complete").await?;
            Ok(true)
        } else {
            self.after_failure(rt, failures.join("; ")).await
        }
    }

    async fn quality_check(&self, rt: &mut TaskRuntime) -> Step {
        if !rt.state.task.current_stage_complete() {
            self.advance(rt, TaskStatus::Planning, "next wave").await?;
            return Ok(true);
        }

        let task = &rt.state.task;
        let stage = task.current_stage_name().to_string();
        let revisions = task.revisions_used(&stage);
        let results: Vec<&SubtaskResult> = task
            .current_stage()
            .map(|s| {
                s.subtasks
                    .iter()
                    .filter_map(|st| task.results.get(&st.name))
                    .collect()
            })
            .unwrap_or_default();

        let verdict = match self.gate.evaluate(&stage, &results, revisions) {
            Ok(verdict) => verdict,
            Err(e) => {
                self.escalate(rt, Blocker::Internal { error: e.to_string() })
                    .await?;
                return Ok(false);
            }
        };
        clog!("Task {} verdict {}", rt.state.task.id.short(), verdict);
        self.events.publish(
            rt.state.task.id,
            EventKind::VerdictRendered {
                stage: stage.clone(),
                score: verdict.score,
                decision: verdict.decision,
            },
        );
        rt.state.verdicts.push(verdict.clone());

        match verdict.decision {
            Decision::Accept => {
                rt.state.task.stage_retries = 0;
                if rt.state.task.is_final_stage() {
                    self.advance(
                        rt,
                        TaskStatus::Synthesizing,
                        format!("{} accepted ({:.2}), final stage", stage, verdict.score),
                    )
                    .await?;
                    return Ok(true);
                }
                rt.state.task.stage_index += 1;
                self.stage_started(rt);
                let Some(plan) = self.replan(rt).await? else {
                    return Ok(false);
                };
                let reason = format!("{} accepted ({:.2})", stage, verdict.score);
                self.route_plan(rt, plan, reason).await
            }
            Decision::Revise => {
                rt.state.task.withdraw_stage_results();
                *rt.state.task.revisions.entry(stage.clone()).or_insert(0) += 1;
                let reason = format!(
                    "revise {} ({:.2}), revision {}",
                    stage,
                    verdict.score,
                    revisions + 1
                );
                self.advance(rt, TaskStatus::Planning, reason).await?;
                self.stage_started(rt);
                Ok(true)
            }
            Decision::EscalateHuman => {
                let error = Error::QualityBelowThreshold {
                    score: verdict.score,
                    threshold: verdict.threshold,
                };
                self.park_for_review(
                    rt,
                    Blocker::QualityEscalation {
                        stage,
                        score: verdict.score,
                    },
                    error.to_string(),
                )
                .await?;
                Ok(false)
            }
        }
    }

    async fn backoff(
        &self,
        slot: &Arc<TaskSlot>,
        rt: MutexGuard<'_, TaskRuntime>,
        token: CancellationToken,
    ) -> Step {
        let attempt = rt.state.task.stage_retries;
        let delay = self.retry.backoff(attempt);
        drop(rt);

        let cancelled = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = token.cancelled() => true,
        };

        let mut rt = slot.runtime.lock().await;
        if cancelled {
            self.finish_cancel(&mut rt).await?;
            return Ok(false);
        }
        self.advance(&mut rt, TaskStatus::Planning, format!("backoff {:?} elapsed", delay))
            .await?;
        Ok(true)
    }

    async fn synthesize(&self, rt: &mut TaskRuntime) -> Step {
        let task_id = rt.state.task.id;
        match self.synthesizer.synthesize(&rt.state).await {
            Ok(output) => {
                rt.state.task.output = Some(output);
                self.advance(rt, TaskStatus::Completed, "output assembled").await?;
                self.events.publish(task_id, EventKind::TaskCompleted);
            }
            Err(e) => {
                clog_error!("Task {} synthesis failed: {}", task_id.short(), e);
                rt.state.block(Blocker::SynthesisFailure {
                    error: e.to_string(),
                });
                self.advance(rt, TaskStatus::Failed, e.to_string()).await?;
                self.events.publish(
                    task_id,
                    EventKind::TaskFailed {
                        reason: e.to_string(),
                    },
                );
            }
        }
        Ok(false)
    }
}
