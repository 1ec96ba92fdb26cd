//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted delegates that replay a fixed sequence of replies
//! - An engine harness with fast retries and a shared checkpoint store
//! - Waiting on tasks and polling for intermediate states

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use conductor::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use conductor::coordinator::{Engine, TaskRequest};
use conductor::core::invocation::InvocationPayload;
use conductor::core::task::{TaskId, TaskStatus};
use conductor::delegate::{Delegate, DelegateClass, DelegateRegistry, DelegateResponse};
use conductor::Config;

/// How long any single test waits for a task to settle.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// One scripted answer from a delegate.
#[derive(Debug, Clone)]
pub enum Reply {
    Succeed {
        result: Value,
        score: Option<f64>,
        delay_ms: u64,
    },
    Fail(String),
    Panic,
    /// Never answers; only a timeout or cancellation closes the invocation.
    Hang,
}

impl Reply {
    pub fn score(score: f64) -> Self {
        Reply::Succeed {
            result: json!({"findings": format!("scored {:.1}", score)}),
            score: Some(score),
            delay_ms: 0,
        }
    }

    pub fn output(result: Value, score: f64) -> Self {
        Reply::Succeed {
            result,
            score: Some(score),
            delay_ms: 0,
        }
    }

    pub fn fail(message: &str) -> Self {
        Reply::Fail(message.to_string())
    }

    /// Delay a successful reply.
    pub fn after(self, ms: u64) -> Self {
        match self {
            Reply::Succeed { result, score, .. } => Reply::Succeed {
                result,
                score,
                delay_ms: ms,
            },
            other => other,
        }
    }
}

/// A delegate that answers from a script, then repeats a fallback reply.
pub struct ScriptedDelegate {
    name: String,
    class: DelegateClass,
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: AtomicUsize,
    payloads: Mutex<Vec<InvocationPayload>>,
}

impl ScriptedDelegate {
    pub fn new(name: &str, script: Vec<Reply>) -> Arc<Self> {
        Self::build(name, DelegateClass::Team, script, Reply::score(4.5))
    }

    /// Every call gets the same reply.
    pub fn always(name: &str, reply: Reply) -> Arc<Self> {
        Self::build(name, DelegateClass::Team, Vec::new(), reply)
    }

    pub fn worker(name: &str, script: Vec<Reply>) -> Arc<Self> {
        Self::build(name, DelegateClass::Worker, script, Reply::score(4.5))
    }

    fn build(name: &str, class: DelegateClass, script: Vec<Reply>, fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            class,
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Payloads received so far, in call order.
    pub fn payloads(&self) -> Vec<InvocationPayload> {
        self.payloads.lock().unwrap().clone()
    }

    fn next_reply(&self) -> Reply {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Delegate for ScriptedDelegate {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> DelegateClass {
        self.class
    }

    async fn execute(&self, payload: &InvocationPayload) -> conductor::Result<DelegateResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push(payload.clone());

        match self.next_reply() {
            Reply::Succeed {
                result,
                score,
                delay_ms,
            } => {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Ok(DelegateResponse::success(result, score))
            }
            Reply::Fail(message) => Ok(DelegateResponse::failure(message)),
            Reply::Panic => panic!("scripted panic in {}", self.name),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(DelegateResponse::failure("woke up"))
            }
        }
    }
}

/// Default config with millisecond backoff and a short cancel grace.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry.backoff_base_ms = 1;
    config.retry.backoff_cap_ms = 5;
    config.invoker.cancel_grace_ms = 500;
    config
}

/// An engine wired to scripted delegates and a checkpoint store.
pub struct Harness {
    pub engine: Engine,
    pub store: Arc<dyn CheckpointStore>,
}

impl Harness {
    pub fn new(config: Config, delegates: &[Arc<ScriptedDelegate>]) -> Self {
        Self::with_store(config, delegates, Arc::new(MemoryCheckpointStore::new()))
    }

    pub fn with_store(
        config: Config,
        delegates: &[Arc<ScriptedDelegate>],
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        let mut registry = DelegateRegistry::new();
        for delegate in delegates {
            registry.register(delegate.clone());
        }
        let engine = Engine::builder(config)
            .registry(registry)
            .store(store.clone())
            .build()
            .expect("engine should build");
        Self { engine, store }
    }

    /// Submit and wait until the driver stops.
    pub async fn run(&self, request: TaskRequest) -> (TaskId, TaskStatus) {
        let task_id = self.engine.submit(request).await.expect("submit failed");
        let status = settle(&self.engine, task_id).await;
        (task_id, status)
    }
}

/// Wait for the task's driver to stop, failing the test on timeout.
pub async fn settle(engine: &Engine, task_id: TaskId) -> TaskStatus {
    tokio::time::timeout(SETTLE_TIMEOUT, engine.wait(task_id))
        .await
        .expect("task did not settle in time")
        .expect("wait failed")
}

/// Poll until the delegate has been called at least `n` times.
pub async fn wait_for_calls(delegate: &ScriptedDelegate, n: usize) {
    let polled = tokio::time::timeout(SETTLE_TIMEOUT, async {
        while delegate.calls() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "{} never reached {} call(s)", delegate.name(), n);
}

/// Poll until the task's latest checkpoint shows `status`.
pub async fn wait_for_checkpoint(store: &Arc<dyn CheckpointStore>, task_id: TaskId, status: TaskStatus) {
    let polled = tokio::time::timeout(SETTLE_TIMEOUT, async {
        loop {
            if let Ok(Some(cp)) = store.latest(task_id).await {
                if cp.state.status() == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "checkpoint never reached {}", status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor::core::task::Priority;

    fn payload() -> InvocationPayload {
        InvocationPayload {
            description: "fixture".to_string(),
            priority: Priority::Normal,
            stage: "research".to_string(),
            subtask: "research".to_string(),
            context: json!({}),
        }
    }

    #[test]
    fn test_scripted_delegate_replays_then_falls_back() {
        let delegate = ScriptedDelegate::new("team", vec![Reply::fail("first"), Reply::score(2.0)]);

        let first = tokio_test::block_on(delegate.execute(&payload())).unwrap();
        assert!(!first.success);
        assert_eq!(first.error.as_deref(), Some("first"));

        let second = tokio_test::block_on(delegate.execute(&payload())).unwrap();
        assert_eq!(second.sub_score, Some(2.0));

        let third = tokio_test::block_on(delegate.execute(&payload())).unwrap();
        assert_eq!(third.sub_score, Some(4.5));
        assert_eq!(delegate.calls(), 3);
        assert_eq!(delegate.payloads().len(), 3);
    }

    #[test]
    fn test_fast_config_is_valid() {
        let config = fast_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries_per_stage, 3);
    }
}
