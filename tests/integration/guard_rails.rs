//! Guard rails seen from the engine: rejected dispatches consume the retry
//! budget and never reach the delegate.

use std::time::Duration;

use conductor::coordinator::{Blocker, EventKind, TaskRequest};
use conductor::core::pipeline::Pipeline;
use conductor::core::task::TaskStatus;

use crate::fixtures::{fast_config, Harness, ScriptedDelegate};

fn request(description: &str) -> TaskRequest {
    TaskRequest::new(description).with_pipeline(Pipeline::single("research", "research_team"))
}

/// Test: blocked term in the payload
/// Given a guard config blocking "wire transfer"
/// When a task mentions it
/// Then every dispatch is rejected and the task escalates without a call
#[tokio::test]
async fn test_blocked_term_never_dispatches() {
    let mut config = fast_config();
    config.guard.blocked_terms = vec!["wire transfer".to_string()];
    let team = ScriptedDelegate::new("research_team", vec![]);
    let harness = Harness::new(config, &[team.clone()]);
    let mut events = harness.engine.subscribe();

    let (task_id, status) = harness
        .run(request("Prepare a Wire Transfer to the vendor"))
        .await;

    assert_eq!(status, TaskStatus::Escalated);
    assert_eq!(team.calls(), 0);

    let state = harness.engine.state(task_id).await.unwrap();
    assert!(state.invocations.is_empty());
    let rejections = state
        .task
        .notes
        .iter()
        .filter(|n| n.contains("blocked term 'wire transfer'"))
        .count();
    assert_eq!(rejections, 4);
    match &state.blocker {
        Some(Blocker::RetriesExhausted { last_error, .. }) => {
            assert!(last_error.contains("policy"))
        }
        other => panic!("unexpected blocker: {:?}", other),
    }

    let mut rejected = 0;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
        if let EventKind::InvocationRejected { delegate, reasons, .. } = event.kind {
            assert_eq!(delegate, "research_team");
            assert!(!reasons.is_empty());
            rejected += 1;
        }
    }
    assert_eq!(rejected, 4);
}

#[tokio::test]
async fn test_oversized_payload_rejected() {
    let mut config = fast_config();
    config.guard.max_payload_bytes = 64;
    let team = ScriptedDelegate::new("research_team", vec![]);
    let harness = Harness::new(config, &[team.clone()]);

    let (task_id, status) = harness
        .run(request("An ordinary description that still exceeds a tiny limit"))
        .await;

    assert_eq!(status, TaskStatus::Escalated);
    assert_eq!(team.calls(), 0);
    let state = harness.engine.state(task_id).await.unwrap();
    assert!(state.task.notes[0].contains("limit 64"));
}

#[tokio::test]
async fn test_tasks_have_separate_histories() {
    let team = ScriptedDelegate::new("research_team", vec![]);
    let harness = Harness::new(fast_config(), &[team.clone()]);

    // Identical requests from two tasks are different actors, so neither
    // counts as a repetition of the other.
    let (_, first) = harness.run(request("Same words")).await;
    let (_, second) = harness.run(request("Same words")).await;

    assert_eq!(first, TaskStatus::Completed);
    assert_eq!(second, TaskStatus::Completed);
    assert_eq!(team.calls(), 2);
}
