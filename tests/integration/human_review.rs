//! Operator review: parking, resume, modify, abort and fail.

use serde_json::json;

use conductor::coordinator::{Blocker, ReviewAction, ReviewDecision, TaskRequest};
use conductor::core::pipeline::{Pipeline, StageSpec, SubtaskSpec};
use conductor::core::task::TaskStatus;
use conductor::core::verdict::Decision;
use conductor::Error;

use crate::fixtures::{fast_config, settle, Harness, Reply, ScriptedDelegate};

fn single_stage() -> Pipeline {
    Pipeline::single("research", "research_team")
}

/// Test: unmet dependency on first plan
/// Given a subtask that depends on a name no stage defines
/// When the task is planned
/// Then it goes straight from Planning to HumanReview with no dispatch
#[tokio::test]
async fn test_blocked_plan_parks_before_dispatch() {
    let pipeline = Pipeline::new(vec![StageSpec::new(
        "research",
        vec![SubtaskSpec::new("web", "research_team").after("interviews")],
    )]);
    let team = ScriptedDelegate::new("research_team", vec![]);
    let harness = Harness::new(fast_config(), &[team.clone()]);

    let (task_id, status) = harness
        .run(TaskRequest::new("Blocked from the start").with_pipeline(pipeline))
        .await;

    assert_eq!(status, TaskStatus::HumanReview);
    assert_eq!(team.calls(), 0);

    let state = harness.engine.state(task_id).await.unwrap();
    let path: Vec<(TaskStatus, TaskStatus)> =
        state.task.history.iter().map(|t| (t.from, t.to)).collect();
    assert_eq!(
        path,
        vec![
            (TaskStatus::Pending, TaskStatus::Planning),
            (TaskStatus::Planning, TaskStatus::HumanReview),
        ]
    );
    assert!(state.invocations.is_empty());
    assert!(matches!(state.blocker, Some(Blocker::DependencyBlocked { .. })));

    let package = harness.engine.review_package(task_id).await.unwrap();
    assert!(package.blocking_reason.unwrap().contains("interviews"));
    assert!(package.recommendations.iter().any(|r| r.contains("`modify`")));
}

#[tokio::test]
async fn test_resume_after_quality_escalation() {
    let mut config = fast_config();
    config.quality.max_revisions = 0;
    let team = ScriptedDelegate::new("research_team", vec![Reply::score(2.0), Reply::score(4.6)]);
    let harness = Harness::new(config, &[team.clone()]);

    let (task_id, status) = harness
        .run(TaskRequest::new("Needs a second look").with_pipeline(single_stage()))
        .await;
    assert_eq!(status, TaskStatus::HumanReview);

    // The re-run payload is identical to the first one; resume clears the
    // task's guard history so it is not treated as a repetition.
    let moved = harness
        .engine
        .submit_review(task_id, ReviewDecision::new(ReviewAction::Resume))
        .await
        .unwrap();
    assert_eq!(moved, TaskStatus::Dispatching);
    assert_eq!(settle(&harness.engine, task_id).await, TaskStatus::Completed);

    let state = harness.engine.state(task_id).await.unwrap();
    let decisions: Vec<Decision> = state.verdicts.iter().map(|v| v.decision).collect();
    assert_eq!(decisions, vec![Decision::EscalateHuman, Decision::Accept]);
    assert!(state.blocker.is_none());
    assert!(state.task.notes.iter().any(|n| n == "operator resume at stage research"));
    assert_eq!(team.calls(), 2);
    let payloads = team.payloads();
    assert_eq!(payloads[0].context, payloads[1].context);
}

#[tokio::test]
async fn test_modify_breaks_a_cycle_with_injected_result() {
    let pipeline = Pipeline::new(vec![StageSpec::new(
        "research",
        vec![
            SubtaskSpec::new("outline", "outline_team").after("sources"),
            SubtaskSpec::new("sources", "sources_team").after("outline"),
        ],
    )]);
    let outline = ScriptedDelegate::new("outline_team", vec![]);
    let sources = ScriptedDelegate::new("sources_team", vec![Reply::output(json!({"count": 12}), 4.0)]);
    let harness = Harness::new(fast_config(), &[outline.clone(), sources.clone()]);

    let (task_id, status) = harness
        .run(
            TaskRequest::new("Circular research")
                .with_pipeline(pipeline)
                .with_context(json!({"region": "EU"})),
        )
        .await;
    assert_eq!(status, TaskStatus::HumanReview);

    let decision = ReviewDecision::new(ReviewAction::Modify).with_payload(json!({
        "context": {"deadline": "friday"},
        "results": {"outline": {"payload": {"sections": 3}, "sub_score": 4.4}}
    }));
    harness.engine.submit_review(task_id, decision).await.unwrap();
    assert_eq!(settle(&harness.engine, task_id).await, TaskStatus::Completed);

    assert_eq!(outline.calls(), 0);
    assert_eq!(sources.calls(), 1);
    let payload = &sources.payloads()[0];
    assert_eq!(payload.context["input"]["region"], "EU");
    assert_eq!(payload.context["input"]["deadline"], "friday");
    assert_eq!(payload.context["upstream"]["outline"]["sections"], 3);

    let state = harness.engine.state(task_id).await.unwrap();
    assert!(state.task.results["outline"].invocation_id.is_none());
    assert!((state.verdicts[0].score - 4.2).abs() < 1e-9);
}

#[tokio::test]
async fn test_resume_that_is_still_blocked_is_refused() {
    let pipeline = Pipeline::new(vec![StageSpec::new(
        "research",
        vec![SubtaskSpec::new("web", "research_team").after("ghost")],
    )]);
    let harness = Harness::new(fast_config(), &[ScriptedDelegate::new("research_team", vec![])]);

    let (task_id, _) = harness
        .run(TaskRequest::new("Still blocked").with_pipeline(pipeline))
        .await;

    let err = harness
        .engine
        .submit_review(task_id, ReviewDecision::new(ReviewAction::Resume))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DependencyBlocked(_)));

    // Nothing changed; the task still waits for a usable decision.
    let report = harness.engine.status(task_id).await.unwrap();
    assert_eq!(report.status, TaskStatus::HumanReview);
}

#[tokio::test]
async fn test_abort_then_fail() {
    let mut config = fast_config();
    config.quality.max_revisions = 0;
    let harness = Harness::new(
        config,
        &[ScriptedDelegate::new("research_team", vec![Reply::score(1.0)])],
    );

    let (task_id, _) = harness
        .run(TaskRequest::new("Abandon me").with_pipeline(single_stage()))
        .await;

    let aborted = harness
        .engine
        .submit_review(
            task_id,
            ReviewDecision::new(ReviewAction::Abort).with_payload(json!({"reason": "scope changed"})),
        )
        .await
        .unwrap();
    assert_eq!(aborted, TaskStatus::Escalated);
    assert_eq!(settle(&harness.engine, task_id).await, TaskStatus::Escalated);
    let state = harness.engine.state(task_id).await.unwrap();
    assert!(matches!(
        &state.blocker,
        Some(Blocker::Aborted { reason: Some(r) }) if r == "scope changed"
    ));

    // Escalated tasks cannot be resumed, only failed.
    let err = harness
        .engine
        .submit_review(task_id, ReviewDecision::new(ReviewAction::Resume))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let failed = harness
        .engine
        .submit_review(task_id, ReviewDecision::new(ReviewAction::Fail))
        .await
        .unwrap();
    assert_eq!(failed, TaskStatus::Failed);
    let report = harness.engine.status(task_id).await.unwrap();
    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.blocking_reason.as_deref(), Some("aborted by operator: scope changed"));
}

#[tokio::test]
async fn test_review_of_completed_task_is_rejected() {
    let harness = Harness::new(fast_config(), &[ScriptedDelegate::new("research_team", vec![])]);
    let (task_id, status) = harness
        .run(TaskRequest::new("Done already").with_pipeline(single_stage()))
        .await;
    assert_eq!(status, TaskStatus::Completed);

    for action in [ReviewAction::Resume, ReviewAction::Abort, ReviewAction::Fail] {
        let err = harness
            .engine
            .submit_review(task_id, ReviewDecision::new(action))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{} accepted", action);
    }
}
