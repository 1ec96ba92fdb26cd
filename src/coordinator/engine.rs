//! Public entry point: submit tasks, query them, review, cancel, resume.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::analysis::{DependencyAnalyzer, StageAnalyzer};
use crate::checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore};
use crate::config::Config;
use crate::coordinator::driver::{spawn_driver, Services, TaskRuntime, TaskSlot};
use crate::coordinator::events::{Event, EventBus, EventKind};
use crate::coordinator::review::{self, ReviewAction, ReviewDecision, ReviewPackage};
use crate::coordinator::state::{Blocker, CoordinationState};
use crate::coordinator::synthesis::{ReportSynthesizer, Synthesizer};
use crate::core::invocation::ErrorKind;
use crate::core::pipeline::Pipeline;
use crate::core::task::{Priority, Task, TaskId, TaskStatus};
use crate::core::verdict::QualityVerdict;
use crate::delegate::{DelegateInvoker, DelegateRegistry};
use crate::error::{Error, Result};
use crate::guard::{ActionHistory, ActorId, GuardRailEvaluator};
use crate::quality::{QualityGate, ScoringPolicy};
use crate::{clog, clog_warn};

/// Inbound submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Caller-chosen id; one is assigned when absent.
    #[serde(default)]
    pub id: Option<TaskId>,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub context: Value,
    /// Overrides the engine's default pipeline.
    #[serde(default)]
    pub pipeline: Option<Pipeline>,
}

impl TaskRequest {
    pub fn new(description: &str) -> Self {
        Self {
            id: None,
            description: description.to_string(),
            priority: Priority::default(),
            context: Value::Object(Default::default()),
            pipeline: None,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub current_stage: String,
    pub last_verdict: Option<QualityVerdict>,
    pub checkpoint_sequence: u64,
    /// Names the condition a parked or failed task is waiting on.
    pub blocking_reason: Option<String>,
    /// False whenever the task is parked or finished.
    pub in_progress: bool,
}

impl StatusReport {
    fn from_state(state: &CoordinationState, checkpoint_sequence: u64) -> Self {
        Self {
            task_id: state.task.id,
            status: state.status(),
            current_stage: state.task.current_stage_name().to_string(),
            last_verdict: state.last_verdict().cloned(),
            checkpoint_sequence,
            blocking_reason: state.task.blocking_reason.clone(),
            in_progress: state.status().is_active(),
        }
    }
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} stage={} checkpoint={}",
            self.task_id, self.status, self.current_stage, self.checkpoint_sequence
        )?;
        if let Some(verdict) = &self.last_verdict {
            write!(f, " verdict=[{}]", verdict)?;
        }
        if let Some(reason) = &self.blocking_reason {
            write!(f, " blocked: {}", reason)?;
        }
        Ok(())
    }
}

pub struct EngineBuilder {
    config: Config,
    registry: DelegateRegistry,
    store: Option<Arc<dyn CheckpointStore>>,
    analyzer: Option<Arc<dyn DependencyAnalyzer>>,
    scoring: Option<Arc<dyn ScoringPolicy>>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    events: Option<EventBus>,
}

impl EngineBuilder {
    pub fn registry(mut self, registry: DelegateRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn DependencyAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn scoring(mut self, policy: Arc<dyn ScoringPolicy>) -> Self {
        self.scoring = Some(policy);
        self
    }

    pub fn synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let Config {
            guard,
            quality,
            retry,
            invoker,
            pipeline,
            ..
        } = self.config;

        let history = Arc::new(RwLock::new(ActionHistory::new(guard.history_capacity)));
        let gate = match self.scoring {
            Some(policy) => QualityGate::with_policy(quality, policy),
            None => QualityGate::new(quality),
        };
        let services = Services {
            analyzer: self.analyzer.unwrap_or_else(|| Arc::new(StageAnalyzer::new())),
            evaluator: GuardRailEvaluator::new(guard),
            invoker: DelegateInvoker::new(Arc::new(self.registry), history, invoker),
            gate,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new())),
            synthesizer: self.synthesizer.unwrap_or_else(|| Arc::new(ReportSynthesizer)),
            events: self.events.unwrap_or_default(),
            retry,
        };

        Ok(Engine {
            inner: Arc::new(EngineInner {
                services: Arc::new(services),
                tasks: RwLock::new(HashMap::new()),
                default_pipeline: pipeline,
            }),
        })
    }
}

struct EngineInner {
    services: Arc<Services>,
    tasks: RwLock<HashMap<TaskId, Arc<TaskSlot>>>,
    default_pipeline: Pipeline,
}

/// The coordination engine. Cheap to clone; clones share every task.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            registry: DelegateRegistry::new(),
            store: None,
            analyzer: None,
            scoring: None,
            synthesizer: None,
            events: None,
        }
    }

    fn services(&self) -> &Arc<Services> {
        &self.inner.services
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.services().events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.services().store
    }

    async fn slot(&self, task_id: TaskId) -> Option<Arc<TaskSlot>> {
        self.inner.tasks.read().await.get(&task_id).cloned()
    }

    async fn loaded(&self, task_id: TaskId) -> Result<Arc<TaskSlot>> {
        self.slot(task_id)
            .await
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    /// Accept a task. Processing continues in the background; the returned
    /// id is the acknowledgment.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        if request.description.trim().is_empty() {
            return Err(Error::Validation("task description is empty".to_string()));
        }
        let pipeline = request
            .pipeline
            .unwrap_or_else(|| self.inner.default_pipeline.clone());
        pipeline.validate()?;

        let mut task = Task::new(&request.description, request.priority, request.context, pipeline);
        if let Some(id) = request.id {
            task = task.with_id(id);
        }
        let task_id = task.id;
        if self.store().latest(task_id).await?.is_some() {
            return Err(Error::TaskExists(task_id.to_string()));
        }

        let mut tasks = self.inner.tasks.write().await;
        if tasks.contains_key(&task_id) {
            return Err(Error::TaskExists(task_id.to_string()));
        }

        let mut runtime = TaskRuntime::new(CoordinationState::new(task), 0);
        self.services().commit(&mut runtime).await?;
        clog!(
            "Task {} accepted: {} ({} stage(s), priority {})",
            task_id.short(),
            runtime.state.task.description,
            runtime.state.task.pipeline.stages.len(),
            runtime.state.task.priority
        );

        let slot = Arc::new(TaskSlot::new(runtime));
        tasks.insert(task_id, slot.clone());
        drop(tasks);

        let rt = slot.runtime.lock().await;
        spawn_driver(self.services(), &slot, &rt)?;
        Ok(task_id)
    }

    /// Status of a loaded task, or of the latest checkpoint otherwise.
    pub async fn status(&self, task_id: TaskId) -> Result<StatusReport> {
        if let Some(slot) = self.slot(task_id).await {
            let rt = slot.runtime.lock().await;
            return Ok(StatusReport::from_state(&rt.state, rt.sequence));
        }
        let checkpoint = self.latest_checkpoint(task_id).await?;
        Ok(StatusReport::from_state(&checkpoint.state, checkpoint.sequence))
    }

    /// Snapshot of the full coordination state.
    pub async fn state(&self, task_id: TaskId) -> Result<CoordinationState> {
        if let Some(slot) = self.slot(task_id).await {
            return Ok(slot.runtime.lock().await.state.clone());
        }
        Ok(self.latest_checkpoint(task_id).await?.state)
    }

    pub async fn history(&self, task_id: TaskId) -> Result<Vec<Checkpoint>> {
        let history = self.store().history(task_id).await?;
        if history.is_empty() {
            return Err(Error::TaskNotFound(task_id.to_string()));
        }
        Ok(history)
    }

    async fn latest_checkpoint(&self, task_id: TaskId) -> Result<Checkpoint> {
        self.store()
            .latest(task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    /// Wait until the task's driver stops: the task finished or parked.
    pub async fn wait(&self, task_id: TaskId) -> Result<TaskStatus> {
        let slot = self.loaded(task_id).await?;
        let mut rx = slot.stopped.subscribe();
        let status = *rx
            .wait_for(|s| s.is_some())
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?;
        Ok(status.unwrap_or_default())
    }

    /// Review package for a parked task.
    pub async fn review_package(&self, task_id: TaskId) -> Result<ReviewPackage> {
        Ok(review::build_package(&self.state(task_id).await?))
    }

    /// Apply an operator decision to a task parked in HumanReview or
    /// Escalated. Returns the status the task moved to.
    pub async fn submit_review(&self, task_id: TaskId, decision: ReviewDecision) -> Result<TaskStatus> {
        let slot = self.loaded(task_id).await?;
        let mut rt = slot.runtime.lock().await;
        if slot.driving.load(Ordering::SeqCst) {
            return Err(Error::DriverBusy(task_id.to_string()));
        }
        let services = self.services();
        let status = rt.state.status();

        match (status, decision.action) {
            (TaskStatus::HumanReview, ReviewAction::Resume | ReviewAction::Modify) => {
                let mut next = rt.state.clone();
                review::prepare_resume(&mut next, &decision)?;
                let plan = services.analyzer.analyze(&next.task, &next.task.results)?;
                if plan.is_blocked() {
                    return Err(Error::DependencyBlocked(plan.blocking_summary()));
                }

                services
                    .invoker
                    .history()
                    .write()
                    .await
                    .clear(&ActorId::from(task_id));
                next.plan = Some(plan);
                next.unblock();
                rt.state = next;
                services
                    .advance(&mut rt, TaskStatus::Dispatching, format!("operator {}", decision.action))
                    .await?;
                spawn_driver(services, &slot, &rt)?;
            }
            (TaskStatus::HumanReview, ReviewAction::Abort) => {
                services
                    .escalate(&mut rt, Blocker::Aborted { reason: decision.reason() })
                    .await?;
            }
            (TaskStatus::HumanReview | TaskStatus::Escalated, ReviewAction::Fail) => {
                let reason = decision
                    .reason()
                    .unwrap_or_else(|| "failed by operator".to_string());
                rt.state.task.note(format!("operator fail: {}", reason));
                services
                    .advance(&mut rt, TaskStatus::Failed, reason.clone())
                    .await?;
                services
                    .events
                    .publish(task_id, EventKind::TaskFailed { reason });
            }
            (from, action) => {
                return Err(Error::Validation(format!(
                    "cannot {} a task that is {}",
                    action, from
                )));
            }
        }

        let status = rt.state.status();
        if !slot.driving.load(Ordering::SeqCst) {
            slot.stopped.send_replace(Some(status));
        }
        Ok(status)
    }

    /// Cancel a task.
    ///
    /// Planning and quality steps finish, then the task escalates. In-flight
    /// invocations are cancelled and given the configured grace period to
    /// acknowledge. A task parked in HumanReview escalates at once.
    pub async fn cancel(&self, task_id: TaskId) -> Result<TaskStatus> {
        let slot = self.loaded(task_id).await?;
        let mut rt = slot.runtime.lock().await;
        let status = rt.state.status();
        match status {
            TaskStatus::HumanReview => {
                self.services().escalate(&mut rt, Blocker::Cancelled).await?;
                let status = rt.state.status();
                slot.stopped.send_replace(Some(status));
                Ok(status)
            }
            s if s.is_active() => {
                clog_warn!("Task {} cancellation requested in {}", task_id.short(), s);
                rt.cancel.cancel();
                Ok(s)
            }
            s => Ok(s),
        }
    }

    /// Load a task from its latest checkpoint and continue it.
    ///
    /// Invocations the checkpoint shows as queued or executing are closed as
    /// interrupted; the normal retry policy then applies. Parked and finished
    /// tasks are loaded without starting a driver.
    pub async fn resume(&self, task_id: TaskId) -> Result<TaskStatus> {
        if let Some(slot) = self.slot(task_id).await {
            let rt = slot.runtime.lock().await;
            if slot.driving.load(Ordering::SeqCst) {
                return Err(Error::DriverBusy(task_id.to_string()));
            }
            let status = rt.state.status();
            if status.is_active() {
                spawn_driver(self.services(), &slot, &rt)?;
            }
            return Ok(status);
        }

        let checkpoint = self.latest_checkpoint(task_id).await?;
        let mut runtime = TaskRuntime::new(checkpoint.state, checkpoint.sequence);
        let interrupted = runtime.state.close_open_invocations(
            ErrorKind::Interrupted,
            "interrupted before completion; resumed from checkpoint",
        );
        if interrupted > 0 {
            clog_warn!(
                "Task {}: {} invocation(s) interrupted, resuming from checkpoint {}",
                task_id.short(),
                interrupted,
                runtime.sequence
            );
            self.services().commit(&mut runtime).await?;
        }
        let status = runtime.state.status();
        clog!(
            "Task {} resumed at {} from checkpoint {}",
            task_id.short(),
            status,
            runtime.sequence
        );

        let slot = Arc::new(TaskSlot::new(runtime));
        {
            let mut tasks = self.inner.tasks.write().await;
            if tasks.contains_key(&task_id) {
                return Err(Error::DriverBusy(task_id.to_string()));
            }
            tasks.insert(task_id, slot.clone());
        }

        let rt = slot.runtime.lock().await;
        if status.is_active() {
            spawn_driver(self.services(), &slot, &rt)?;
        } else {
            slot.stopped.send_replace(Some(status));
        }
        Ok(status)
    }

    /// Resume every unfinished task in the checkpoint store. Returns the
    /// ids that were loaded.
    pub async fn resume_all(&self) -> Result<Vec<TaskId>> {
        let mut resumed = Vec::new();
        for task_id in self.store().task_ids().await? {
            if self.slot(task_id).await.is_some() {
                continue;
            }
            let Some(checkpoint) = self.store().latest(task_id).await? else {
                continue;
            };
            if checkpoint.state.status().is_terminal() {
                continue;
            }
            self.resume(task_id).await?;
            resumed.push(task_id);
        }
        Ok(resumed)
    }

    /// Ids of tasks loaded in this engine.
    pub async fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.inner.tasks.read().await.keys().copied().collect();
        ids.sort();
        ids
    }
}
