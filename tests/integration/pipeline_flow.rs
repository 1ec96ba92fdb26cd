//! End-to-end runs of the stage pipeline: acceptance, revision and quality
//! escalation, checked through status, verdicts, checkpoints and events.

use std::time::Duration;

use serde_json::json;

use conductor::coordinator::{EventKind, TaskRequest};
use conductor::core::pipeline::Pipeline;
use conductor::core::invocation::InvocationStatus;
use conductor::core::task::{Priority, TaskStatus};
use conductor::core::verdict::Decision;

use crate::fixtures::{
    fast_config, settle, wait_for_calls, wait_for_checkpoint, Harness, Reply, ScriptedDelegate,
};

fn single_stage() -> Pipeline {
    Pipeline::single("research", "research_team")
}

/// Test: single stage accepted
/// Given one delegate that reports 4.5
/// When the task runs
/// Then the verdict is Accept and the task completes with output
#[tokio::test]
async fn test_single_stage_accepts_and_completes() {
    let team = ScriptedDelegate::new("research_team", vec![Reply::score(4.5)]);
    let harness = Harness::new(fast_config(), &[team.clone()]);

    let (task_id, status) = harness
        .run(TaskRequest::new("Survey EU battery suppliers").with_pipeline(single_stage()))
        .await;

    assert_eq!(status, TaskStatus::Completed);
    let state = harness.engine.state(task_id).await.unwrap();
    assert_eq!(state.verdicts.len(), 1);
    assert_eq!(state.verdicts[0].decision, Decision::Accept);
    assert_eq!(state.verdicts[0].score, 4.5);
    assert_eq!(team.calls(), 1);

    let output = state.task.output.expect("completed task has output");
    assert_eq!(output["stages"][0]["name"], "research");
    assert_eq!(output["final_score"], 4.5);

    let report = harness.engine.status(task_id).await.unwrap();
    assert!(!report.in_progress);
    assert!(report.blocking_reason.is_none());
}

/// Test: one revision then accept
/// Given a delegate scoring 3.2 then 4.1
/// When the stage is evaluated twice
/// Then the gate revises once, then accepts
#[tokio::test]
async fn test_revise_then_accept() {
    let team = ScriptedDelegate::new(
        "research_team",
        vec![Reply::score(3.2), Reply::score(4.1)],
    );
    let harness = Harness::new(fast_config(), &[team.clone()]);

    let (task_id, status) = harness
        .run(TaskRequest::new("Draft a pricing memo").with_pipeline(single_stage()))
        .await;

    assert_eq!(status, TaskStatus::Completed);
    let state = harness.engine.state(task_id).await.unwrap();
    let decisions: Vec<Decision> = state.verdicts.iter().map(|v| v.decision).collect();
    assert_eq!(decisions, vec![Decision::Revise, Decision::Accept]);
    assert_eq!(state.task.revisions_used("research"), 1);

    // The revision pass carries the verdict findings back to the delegate.
    let payloads = team.payloads();
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[0].context["revision"], 0);
    assert!(payloads[0].context.get("feedback").is_none());
    assert_eq!(payloads[1].context["revision"], 1);
    let feedback = payloads[1].context["feedback"].as_str().unwrap();
    assert!(feedback.contains("below acceptance threshold"));
}

/// Test: low score with no revision budget
/// Given max_revisions = 0 and a delegate scoring 2.0
/// When the stage is evaluated
/// Then the task parks in HumanReview with an EscalateHuman verdict
#[tokio::test]
async fn test_low_score_parks_for_review() {
    let mut config = fast_config();
    config.quality.max_revisions = 0;
    let team = ScriptedDelegate::new("research_team", vec![Reply::score(2.0)]);
    let harness = Harness::new(config, &[team]);

    let (task_id, status) = harness
        .run(TaskRequest::new("Rank vendors").with_pipeline(single_stage()))
        .await;

    assert_eq!(status, TaskStatus::HumanReview);
    let report = harness.engine.status(task_id).await.unwrap();
    let verdict = report.last_verdict.expect("verdict recorded");
    assert_eq!(verdict.decision, Decision::EscalateHuman);
    assert!(!report.in_progress);
    assert!(report
        .blocking_reason
        .unwrap()
        .contains("quality review needed for research"));
}

#[tokio::test]
async fn test_revision_budget_exhaustion_escalates() {
    let team = ScriptedDelegate::always("research_team", Reply::score(3.5));
    let harness = Harness::new(fast_config(), &[team.clone()]);

    let (task_id, status) = harness
        .run(TaskRequest::new("Check the forecast").with_pipeline(single_stage()))
        .await;

    assert_eq!(status, TaskStatus::HumanReview);
    let state = harness.engine.state(task_id).await.unwrap();
    let decisions: Vec<Decision> = state.verdicts.iter().map(|v| v.decision).collect();
    assert_eq!(
        decisions,
        vec![Decision::Revise, Decision::Revise, Decision::EscalateHuman]
    );
    assert_eq!(team.calls(), 3);
}

#[tokio::test]
async fn test_default_pipeline_threads_upstream_results() {
    let teams: Vec<_> = ["research_team", "analysis_team", "writing_team", "rating_team"]
        .iter()
        .map(|name| {
            ScriptedDelegate::always(
                name,
                Reply::output(json!({"by": name, "artifacts": {"latest": name}}), 4.4),
            )
        })
        .collect();
    let harness = Harness::new(fast_config(), &teams);

    let (task_id, status) = harness
        .run(
            TaskRequest::new("Quarterly market outlook")
                .with_priority(Priority::High)
                .with_context(json!({"region": "APAC"})),
        )
        .await;
    assert_eq!(status, TaskStatus::Completed);

    let writing = teams[2].payloads();
    assert_eq!(writing.len(), 1);
    assert_eq!(writing[0].stage, "writing");
    assert_eq!(writing[0].priority, Priority::High);
    assert_eq!(writing[0].context["input"]["region"], "APAC");
    assert_eq!(writing[0].context["upstream"]["analysis"]["by"], "analysis_team");

    let state = harness.engine.state(task_id).await.unwrap();
    assert_eq!(state.verdicts.len(), 4);
    assert_eq!(state.task.stage_index, 3);
    let output = state.task.output.unwrap();
    assert_eq!(output["stages"].as_array().unwrap().len(), 4);
    assert_eq!(output["artifacts"]["latest"], "rating_team");
}

#[tokio::test]
async fn test_checkpoint_sequences_are_gap_free() {
    let team = ScriptedDelegate::new("research_team", vec![Reply::score(3.4)]);
    let harness = Harness::new(fast_config(), &[team]);

    let (task_id, _) = harness
        .run(TaskRequest::new("Sequence check").with_pipeline(single_stage()))
        .await;

    let history = harness.engine.history(task_id).await.unwrap();
    let sequences: Vec<u64> = history.iter().map(|c| c.sequence).collect();
    let expected: Vec<u64> = (1..=history.len() as u64).collect();
    assert_eq!(sequences, expected);

    assert_eq!(history[0].state.status(), TaskStatus::Pending);
    assert_eq!(history.last().unwrap().state.status(), TaskStatus::Completed);

    let report = harness.engine.status(task_id).await.unwrap();
    assert_eq!(report.checkpoint_sequence, history.len() as u64);
}

/// Test: a single-subtask wave is visible while the delegate works
/// Given a delegate that takes a while to answer
/// When the task runs
/// Then the issued event and an executing record are out before the reply
#[tokio::test]
async fn test_event_stream_follows_the_run() {
    let team = ScriptedDelegate::new("research_team", vec![Reply::score(4.8).after(400)]);
    let harness = Harness::new(fast_config(), &[team.clone()]);
    let mut events = harness.engine.subscribe();

    let task_id = harness
        .engine
        .submit(TaskRequest::new("Event check").with_pipeline(single_stage()))
        .await
        .unwrap();
    wait_for_calls(&team, 1).await;
    wait_for_checkpoint(&harness.store, task_id, TaskStatus::AwaitingResults).await;

    let in_flight = harness.store.latest(task_id).await.unwrap().unwrap();
    assert_eq!(in_flight.state.invocations.len(), 1);
    assert_eq!(in_flight.state.invocations[0].status, InvocationStatus::Executing);
    assert_eq!(in_flight.state.wave, vec![in_flight.state.invocations[0].id]);

    let mut before_reply = Vec::new();
    while let Ok(event) = events.try_recv() {
        before_reply.push(event.kind);
    }
    assert!(before_reply
        .iter()
        .any(|k| matches!(k, EventKind::InvocationIssued { delegate, .. } if delegate == "research_team")));
    assert!(!before_reply
        .iter()
        .any(|k| matches!(k, EventKind::InvocationCompleted { .. })));

    assert_eq!(settle(&harness.engine, task_id).await, TaskStatus::Completed);

    let mut kinds = before_reply;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
        assert_eq!(event.task_id, task_id);
        let done = matches!(event.kind, EventKind::TaskCompleted);
        kinds.push(event.kind);
        if done {
            break;
        }
    }

    assert!(matches!(kinds.first(), Some(EventKind::StatusChanged { .. })));
    assert!(kinds
        .iter()
        .any(|k| matches!(k, EventKind::StageStarted { stage, revision: 0 } if stage == "research")));
    assert!(kinds
        .iter()
        .any(|k| matches!(k, EventKind::InvocationIssued { delegate, .. } if delegate == "research_team")));
    assert!(kinds.iter().any(|k| matches!(
        k,
        EventKind::VerdictRendered {
            decision: Decision::Accept,
            ..
        }
    )));
    assert!(matches!(kinds.last(), Some(EventKind::TaskCompleted)));
}
