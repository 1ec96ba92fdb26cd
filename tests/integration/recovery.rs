//! Checkpoint persistence and resumption across engine instances.
//!
//! A second engine built over the same checkpoint directory stands in for a
//! restarted process.

use std::sync::Arc;

use tempfile::TempDir;

use conductor::checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore};
use conductor::coordinator::{next_action, NextAction, TaskRequest};
use conductor::core::invocation::ErrorKind;
use conductor::core::pipeline::{Pipeline, StageSpec, SubtaskSpec};
use conductor::core::task::TaskStatus;

use crate::fixtures::{fast_config, settle, wait_for_checkpoint, Harness, Reply, ScriptedDelegate};

fn file_store(dir: &TempDir) -> Arc<dyn CheckpointStore> {
    Arc::new(FileCheckpointStore::new(dir.path()))
}

fn pair_pipeline() -> Pipeline {
    Pipeline::new(vec![StageSpec::new(
        "research",
        vec![
            SubtaskSpec::new("web", "web_team"),
            SubtaskSpec::new("papers", "papers_team"),
        ],
    )])
}

#[tokio::test]
async fn test_checkpoint_roundtrip_through_files() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::with_store(
        fast_config(),
        &[ScriptedDelegate::new("research_team", vec![Reply::score(3.5)])],
        file_store(&dir),
    );

    let (task_id, status) = harness
        .run(TaskRequest::new("Persist me").with_pipeline(Pipeline::single("research", "research_team")))
        .await;
    assert_eq!(status, TaskStatus::Completed);

    let first = dir.path().join(task_id.to_string()).join("0000000001.json");
    assert!(first.exists());

    let latest = harness.store.latest(task_id).await.unwrap().unwrap();
    let text = serde_json::to_string(&latest).unwrap();
    let back: Checkpoint = serde_json::from_str(&text).unwrap();
    assert_eq!(back.state.status(), latest.state.status());
    assert_eq!(back.state.invocations, latest.state.invocations);
    assert_eq!(back.state.verdicts, latest.state.verdicts);
    assert_eq!(back, latest);
}

/// Test: resumed parked task
/// Given a task parked in HumanReview by one engine
/// When a fresh engine over the same directory resumes it
/// Then it sees the same state and computes the same next action
#[tokio::test]
async fn test_fresh_engine_resumes_parked_task() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config();
    config.quality.max_revisions = 0;

    let first = Harness::with_store(
        config.clone(),
        &[ScriptedDelegate::new("research_team", vec![Reply::score(2.0)])],
        file_store(&dir),
    );
    let (task_id, status) = first
        .run(TaskRequest::new("Park and restart").with_pipeline(Pipeline::single("research", "research_team")))
        .await;
    assert_eq!(status, TaskStatus::HumanReview);
    let before = first.engine.state(task_id).await.unwrap();

    let team = ScriptedDelegate::new("research_team", vec![Reply::score(4.7)]);
    let second = Harness::with_store(config, &[team.clone()], file_store(&dir));
    assert_eq!(second.engine.status(task_id).await.unwrap().status, TaskStatus::HumanReview);

    let resumed = second.engine.resume(task_id).await.unwrap();
    assert_eq!(resumed, TaskStatus::HumanReview);
    let after = second.engine.state(task_id).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(next_action(&after), next_action(&before));
    assert!(matches!(next_action(&after), NextAction::AwaitOperator { .. }));
    assert_eq!(team.calls(), 0);
}

#[tokio::test]
async fn test_interrupted_wave_is_retried_after_restart() {
    let dir = TempDir::new().unwrap();
    let config = fast_config();

    // The first engine's delegates never answer; its wave is left open.
    let first = Harness::with_store(
        config.clone(),
        &[
            ScriptedDelegate::always("web_team", Reply::Hang),
            ScriptedDelegate::always("papers_team", Reply::Hang),
        ],
        file_store(&dir),
    );
    let task_id = first
        .engine
        .submit(TaskRequest::new("Crash mid-wave").with_pipeline(pair_pipeline()))
        .await
        .unwrap();
    wait_for_checkpoint(&first.store, task_id, TaskStatus::AwaitingResults).await;

    let crashed = first.store.latest(task_id).await.unwrap().unwrap();
    match next_action(&crashed.state) {
        NextAction::AwaitWave { outstanding } => assert_eq!(outstanding.len(), 2),
        other => panic!("unexpected next action: {:?}", other),
    }

    let web = ScriptedDelegate::new("web_team", vec![]);
    let papers = ScriptedDelegate::new("papers_team", vec![]);
    let second = Harness::with_store(config, &[web.clone(), papers.clone()], file_store(&dir));
    second.engine.resume(task_id).await.unwrap();
    assert_eq!(settle(&second.engine, task_id).await, TaskStatus::Completed);

    let state = second.engine.state(task_id).await.unwrap();
    let interrupted = state
        .invocations
        .iter()
        .filter(|i| i.error_kind() == Some(ErrorKind::Interrupted))
        .count();
    assert_eq!(interrupted, 2);
    assert_eq!((web.calls(), papers.calls()), (1, 1));

    // The restart continued the same gap-free log.
    let history = second.engine.history(task_id).await.unwrap();
    assert!(history.len() as u64 > crashed.sequence);
    for (i, checkpoint) in history.iter().enumerate() {
        assert_eq!(checkpoint.sequence, i as u64 + 1);
    }
}

#[tokio::test]
async fn test_resume_all_skips_finished_tasks() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config();
    config.quality.max_revisions = 0;
    let pipeline = Pipeline::single("research", "research_team");

    let first = Harness::with_store(
        config.clone(),
        &[ScriptedDelegate::new(
            "research_team",
            vec![Reply::score(4.5), Reply::score(1.0)],
        )],
        file_store(&dir),
    );
    let (done, _) = first
        .run(TaskRequest::new("Finished").with_pipeline(pipeline.clone()))
        .await;
    let (parked, status) = first
        .run(TaskRequest::new("Parked").with_pipeline(pipeline))
        .await;
    assert_eq!(status, TaskStatus::HumanReview);

    let second = Harness::with_store(config, &[], file_store(&dir));
    let resumed = second.engine.resume_all().await.unwrap();
    assert_eq!(resumed, vec![parked]);
    assert_eq!(second.engine.task_ids().await, vec![parked]);
    // Finished tasks stay queryable straight from the store.
    assert_eq!(second.engine.status(done).await.unwrap().status, TaskStatus::Completed);
}
