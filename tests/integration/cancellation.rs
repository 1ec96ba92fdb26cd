//! Task cancellation in each waiting posture.

use conductor::coordinator::{Blocker, TaskRequest};
use conductor::core::invocation::ErrorKind;
use conductor::core::pipeline::{Pipeline, StageSpec, SubtaskSpec};
use conductor::core::task::TaskStatus;

use crate::fixtures::{
    fast_config, settle, wait_for_calls, wait_for_checkpoint, Harness, Reply, ScriptedDelegate,
};

fn single_stage() -> Pipeline {
    Pipeline::single("research", "research_team")
}

/// Test: cancel during a parallel wave
/// Given two delegates that never answer
/// When the task is cancelled while awaiting results
/// Then both invocations close as cancelled and the task escalates
#[tokio::test]
async fn test_cancel_in_flight_wave() {
    let web = ScriptedDelegate::always("web_team", Reply::Hang);
    let papers = ScriptedDelegate::always("papers_team", Reply::Hang);
    let harness = Harness::new(fast_config(), &[web.clone(), papers.clone()]);
    let pipeline = Pipeline::new(vec![StageSpec::new(
        "research",
        vec![
            SubtaskSpec::new("web", "web_team"),
            SubtaskSpec::new("papers", "papers_team"),
        ],
    )]);

    let task_id = harness
        .engine
        .submit(TaskRequest::new("Cancel the wave").with_pipeline(pipeline))
        .await
        .unwrap();
    wait_for_checkpoint(&harness.store, task_id, TaskStatus::AwaitingResults).await;
    wait_for_calls(&web, 1).await;
    wait_for_calls(&papers, 1).await;

    let at_cancel = harness.engine.cancel(task_id).await.unwrap();
    assert_eq!(at_cancel, TaskStatus::AwaitingResults);
    assert_eq!(settle(&harness.engine, task_id).await, TaskStatus::Escalated);

    let state = harness.engine.state(task_id).await.unwrap();
    assert_eq!(state.blocker, Some(Blocker::Cancelled));
    assert_eq!(state.invocations.len(), 2);
    assert!(state
        .invocations
        .iter()
        .all(|i| i.error_kind() == Some(ErrorKind::Cancelled)));
    assert!(state.wave.is_empty());
}

#[tokio::test]
async fn test_cancel_single_blocking_invocation() {
    let team = ScriptedDelegate::always("research_team", Reply::Hang);
    let harness = Harness::new(fast_config(), &[team.clone()]);

    let task_id = harness
        .engine
        .submit(TaskRequest::new("Cancel the call").with_pipeline(single_stage()))
        .await
        .unwrap();
    wait_for_calls(&team, 1).await;

    harness.engine.cancel(task_id).await.unwrap();
    assert_eq!(settle(&harness.engine, task_id).await, TaskStatus::Escalated);

    let state = harness.engine.state(task_id).await.unwrap();
    assert_eq!(state.invocations[0].error_kind(), Some(ErrorKind::Cancelled));
    assert_eq!(team.calls(), 1);
}

#[tokio::test]
async fn test_cancel_during_backoff() {
    let mut config = fast_config();
    config.retry.backoff_base_ms = 60_000;
    config.retry.backoff_cap_ms = 60_000;
    let team = ScriptedDelegate::new("research_team", vec![Reply::fail("flaky")]);
    let harness = Harness::new(config, &[team.clone()]);

    let task_id = harness
        .engine
        .submit(TaskRequest::new("Cancel the wait").with_pipeline(single_stage()))
        .await
        .unwrap();
    wait_for_checkpoint(&harness.store, task_id, TaskStatus::Retrying).await;

    harness.engine.cancel(task_id).await.unwrap();
    assert_eq!(settle(&harness.engine, task_id).await, TaskStatus::Escalated);
    assert_eq!(team.calls(), 1);
}

#[tokio::test]
async fn test_cancel_parked_and_finished_tasks() {
    let mut config = fast_config();
    config.quality.max_revisions = 0;
    let harness = Harness::new(
        config,
        &[ScriptedDelegate::new(
            "research_team",
            vec![Reply::score(1.5), Reply::score(4.5)],
        )],
    );

    let (parked, status) = harness
        .run(TaskRequest::new("Parked").with_pipeline(single_stage()))
        .await;
    assert_eq!(status, TaskStatus::HumanReview);
    assert_eq!(harness.engine.cancel(parked).await.unwrap(), TaskStatus::Escalated);
    let report = harness.engine.status(parked).await.unwrap();
    assert_eq!(report.blocking_reason.as_deref(), Some("cancelled"));

    let (done, status) = harness
        .run(TaskRequest::new("Done").with_pipeline(single_stage()))
        .await;
    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(harness.engine.cancel(done).await.unwrap(), TaskStatus::Completed);
    assert_eq!(
        harness.engine.history(done).await.unwrap().last().unwrap().state.status(),
        TaskStatus::Completed
    );
}
