//! Parallel waves: barrier semantics, partial failure and artifact merging.

use serde_json::json;

use conductor::coordinator::TaskRequest;
use conductor::core::pipeline::{Pipeline, StageSpec, SubtaskSpec};
use conductor::core::task::TaskStatus;

use crate::fixtures::{fast_config, Harness, Reply, ScriptedDelegate};

fn fan_out() -> Pipeline {
    Pipeline::new(vec![
        StageSpec::new(
            "research",
            vec![
                SubtaskSpec::new("web", "web_team"),
                SubtaskSpec::new("papers", "papers_team"),
                SubtaskSpec::new("summary", "summary_team")
                    .after("web")
                    .after("papers"),
            ],
        ),
        StageSpec::new(
            "writing",
            vec![SubtaskSpec::new("draft", "writing_team").after("summary")],
        ),
    ])
}

/// Test: fan-out then fan-in within one stage
/// Given two independent subtasks and one that needs both
/// When the stage runs
/// Then the pair runs as one wave and the summary runs after both
#[tokio::test]
async fn test_independent_subtasks_share_a_wave() {
    let web = ScriptedDelegate::new("web_team", vec![Reply::score(4.5).after(40)]);
    let papers = ScriptedDelegate::new("papers_team", vec![Reply::score(4.5).after(10)]);
    let summary = ScriptedDelegate::new("summary_team", vec![]);
    let writing = ScriptedDelegate::new("writing_team", vec![]);
    let harness = Harness::new(
        fast_config(),
        &[web.clone(), papers.clone(), summary.clone(), writing.clone()],
    );

    let (task_id, status) = harness
        .run(TaskRequest::new("Literature review").with_pipeline(fan_out()))
        .await;
    assert_eq!(status, TaskStatus::Completed);

    let state = harness.engine.state(task_id).await.unwrap();
    let web_inv = state.invocations.iter().find(|i| i.subtask == "web").unwrap();
    let papers_inv = state.invocations.iter().find(|i| i.subtask == "papers").unwrap();
    let summary_inv = state.invocations.iter().find(|i| i.subtask == "summary").unwrap();

    // The summary only starts once the slower sibling has finished.
    assert!(summary_inv.created_at >= web_inv.finished_at.unwrap());
    assert!(summary_inv.created_at >= papers_inv.finished_at.unwrap());

    let upstream = &summary.payloads()[0].context["upstream"];
    assert!(upstream.get("web").is_some());
    assert!(upstream.get("papers").is_some());

    // research verdict covers all three subtasks, then writing.
    assert_eq!(state.verdicts.len(), 2);
    assert_eq!(state.verdicts[0].stage, "research");
    assert_eq!(writing.calls(), 1);

    // Planning is entered on start and again between the wave and the
    // summary; an accepted stage goes straight to dispatching the next.
    let planning_entries = state
        .task
        .history
        .iter()
        .filter(|t| t.to == TaskStatus::Planning)
        .count();
    assert_eq!(planning_entries, 2);
}

#[tokio::test]
async fn test_failed_sibling_is_the_only_one_rerun() {
    let web = ScriptedDelegate::new("web_team", vec![]);
    let papers = ScriptedDelegate::new("papers_team", vec![Reply::fail("paywall")]);
    let summary = ScriptedDelegate::new("summary_team", vec![]);
    let writing = ScriptedDelegate::new("writing_team", vec![]);
    let harness = Harness::new(
        fast_config(),
        &[web.clone(), papers.clone(), summary.clone(), writing],
    );

    let (task_id, status) = harness
        .run(TaskRequest::new("Partial failure").with_pipeline(fan_out()))
        .await;
    assert_eq!(status, TaskStatus::Completed);

    assert_eq!(web.calls(), 1);
    assert_eq!(papers.calls(), 2);
    assert_eq!(summary.calls(), 1);

    let state = harness.engine.state(task_id).await.unwrap();
    let retry_payload = &papers.payloads()[1];
    assert_eq!(retry_payload.context["attempt"], 1);
    assert!(retry_payload.context["previous_error"]
        .as_str()
        .unwrap()
        .contains("paywall"));
    assert_eq!(state.task.stage_retries, 0);
}

/// Two subtasks write the same artifact name; the one that completed last wins.
#[tokio::test]
async fn test_artifact_conflict_last_completion_wins() {
    let pipeline = Pipeline::new(vec![StageSpec::new(
        "research",
        vec![
            SubtaskSpec::new("fast", "fast_team"),
            SubtaskSpec::new("slow", "slow_team"),
        ],
    )]);
    let fast = ScriptedDelegate::new(
        "fast_team",
        vec![Reply::output(json!({"artifacts": {"chart": "fast", "table": "fast"}}), 4.5).after(5)],
    );
    let slow = ScriptedDelegate::new(
        "slow_team",
        vec![Reply::output(json!({"artifacts": {"chart": "slow"}}), 4.5).after(80)],
    );
    let harness = Harness::new(fast_config(), &[fast, slow]);

    let (task_id, status) = harness
        .run(TaskRequest::new("Artifact race").with_pipeline(pipeline))
        .await;
    assert_eq!(status, TaskStatus::Completed);

    let output = harness.engine.state(task_id).await.unwrap().task.output.unwrap();
    assert_eq!(output["artifacts"]["chart"], "slow");
    assert_eq!(output["artifacts"]["table"], "fast");
}
