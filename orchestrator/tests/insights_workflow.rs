//! End-to-end tests for the insights workflow.
//!
//! A scripted `sh` agent stands in for `codex`; everything else (job runner,
//! prompt rendering, output validation, artifact store, run records) is real.
#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use codex_orchestrator::core::ids::SessionId;
use codex_orchestrator::core::job::{FailureReason, JobState, JobStatus};
use codex_orchestrator::core::run::{RunEntry, RunKind, RunMode, RunOutcome};
use codex_orchestrator::error::ErrorCode;
use codex_orchestrator::insights::InsightsRequest;
use codex_orchestrator::test_support::{ScriptedInvoker, TestWorkspace, insights_message};

const WAIT: Duration = Duration::from_secs(30);

fn abc() -> SessionId {
    SessionId::parse("abc").expect("session id")
}

fn request(mode: RunMode) -> InsightsRequest {
    InsightsRequest {
        session_id: abc(),
        prompt: "What slowed us down?".to_string(),
        mode,
        model: None,
    }
}

#[test]
fn fork_run_for_session_abc_stores_markdown() {
    let ws = TestWorkspace::new();
    let agent = Arc::new(ScriptedInvoker::replying(&insights_message(
        "## Findings\nThe schema location was looked up three times.",
    )));
    let orchestrator = ws.orchestrator(agent.clone());

    let handle = orchestrator
        .start_insights(request(RunMode::Fork))
        .expect("start");
    let completion = handle.completion.recv_timeout(WAIT).expect("completion");

    assert_eq!(completion.job.status(), JobStatus::Succeeded);
    assert_eq!(completion.outcome, RunOutcome::Stored);
    assert!(completion.errors.is_empty());

    let artifact = orchestrator
        .store()
        .get_insight(&abc(), &handle.artifact_id)
        .expect("artifact");
    assert_eq!(
        artifact.markdown.as_deref(),
        Some("## Findings\nThe schema location was looked up three times.\n")
    );
    let json = artifact.json.expect("json payload");
    assert_eq!(json["skill_candidates"][0]["name"], "db-access");

    let requests = agent.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].mode, RunMode::Fork);
    assert!(requests[0].prompt.contains("Where is the db schema?"));
    assert!(requests[0].prompt.contains("What slowed us down?"));
    assert!(requests[0].output_schema_path.is_file());
}

#[test]
fn poll_reports_outcome_and_agent_events() {
    let ws = TestWorkspace::new();
    let orchestrator = ws.orchestrator(Arc::new(ScriptedInvoker::replying(&insights_message(
        "notes",
    ))));

    let handle = orchestrator
        .start_insights(request(RunMode::Fork))
        .expect("start");
    handle.completion.recv_timeout(WAIT).expect("completion");

    let view = orchestrator.poll_job(&handle.job_id, 10).expect("poll");
    assert_eq!(view.outcome, Some(RunOutcome::Stored));
    assert_eq!(view.job.task_id.as_deref(), Some("t-1"));
    assert_eq!(view.job.events_tail.len(), 1);

    let run = orchestrator.store().get_run(&handle.job_id).expect("run record");
    assert_eq!(run.len(), 2);
    match &run[0] {
        RunEntry::Started {
            kind,
            inputs,
            outputs,
            ..
        } => {
            assert_eq!(*kind, RunKind::Insights);
            assert_eq!(inputs.session_id, abc());
            assert_eq!(outputs.artifact_id.as_ref(), Some(&handle.artifact_id));
        }
        other => panic!("expected started entry, got {other:?}"),
    }
    assert!(matches!(
        run[1],
        RunEntry::Finished {
            outcome: RunOutcome::Stored,
            status: JobStatus::Succeeded,
            ..
        }
    ));
}

#[test]
fn failed_job_surfaces_stderr_and_stores_nothing() {
    let ws = TestWorkspace::new();
    let orchestrator = ws.orchestrator(Arc::new(ScriptedInvoker::failing("model overloaded", 2)));

    let handle = orchestrator
        .start_insights(request(RunMode::Fork))
        .expect("start");
    let completion = handle.completion.recv_timeout(WAIT).expect("completion");

    assert!(matches!(
        completion.job.state,
        JobState::Failed {
            reason: FailureReason::Exit,
            returncode: Some(2),
            ..
        }
    ));
    assert_eq!(completion.outcome, RunOutcome::ProcessFailed);
    assert_eq!(completion.errors[0], "process exited with code 2");
    assert!(completion.errors.iter().any(|e| e == "model overloaded"));
    assert!(
        completion
            .job
            .stderr_tail
            .contains(&"model overloaded".to_string())
    );

    let err = orchestrator
        .store()
        .get_insight(&abc(), &handle.artifact_id)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
fn non_json_output_is_a_schema_violation_not_a_process_failure() {
    let ws = TestWorkspace::new();
    let orchestrator = ws.orchestrator(Arc::new(ScriptedInvoker::replying("Here are my notes!")));

    let handle = orchestrator
        .start_insights(request(RunMode::Fork))
        .expect("start");
    let completion = handle.completion.recv_timeout(WAIT).expect("completion");

    assert_eq!(completion.job.status(), JobStatus::Succeeded);
    assert_eq!(completion.outcome, RunOutcome::SchemaViolation);
    assert!(!completion.errors.is_empty());
    assert!(
        orchestrator
            .store()
            .get_insight(&abc(), &handle.artifact_id)
            .is_err()
    );
}

#[test]
fn resume_mode_hands_the_session_to_the_agent() {
    let ws = TestWorkspace::new();
    let agent = Arc::new(ScriptedInvoker::replying(&insights_message("notes")));
    let orchestrator = ws.orchestrator(agent.clone());

    let handle = orchestrator
        .start_insights(request(RunMode::Resume))
        .expect("start");
    handle.completion.recv_timeout(WAIT).expect("completion");

    let requests = agent.requests();
    assert_eq!(requests[0].mode, RunMode::Resume);
    assert_eq!(requests[0].session_id, abc());
    assert!(!requests[0].prompt.contains("Where is the db schema?"));
}

#[test]
fn unknown_session_fails_before_starting_a_job() {
    let ws = TestWorkspace::new();
    let agent = Arc::new(ScriptedInvoker::replying(&insights_message("notes")));
    let orchestrator = ws.orchestrator(agent.clone());

    let err = orchestrator
        .start_insights(InsightsRequest {
            session_id: SessionId::parse("nope").expect("id"),
            ..request(RunMode::Fork)
        })
        .err()
        .expect("unknown session");
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert!(agent.requests().is_empty());
}

#[test]
fn blank_prompt_is_rejected() {
    let ws = TestWorkspace::new();
    let agent = Arc::new(ScriptedInvoker::replying(&insights_message("notes")));
    let orchestrator = ws.orchestrator(agent.clone());

    let err = orchestrator
        .start_insights(InsightsRequest {
            prompt: "   ".to_string(),
            ..request(RunMode::Fork)
        })
        .err()
        .expect("blank prompt");
    assert_eq!(err.code(), ErrorCode::PreconditionFailed);
    assert!(agent.requests().is_empty());
}

/// The scripted agent backgrounds its sleep, so the job's pipes stay open in a
/// grandchild until the whole process group is killed.
#[test]
fn canceled_run_is_recorded_as_canceled() {
    let ws = TestWorkspace::new();
    let orchestrator = ws.orchestrator(Arc::new(ScriptedInvoker::sleeping(30)));

    let handle = orchestrator
        .start_insights(request(RunMode::Fork))
        .expect("start");
    let deadline = Instant::now() + Duration::from_secs(10);
    while orchestrator
        .poll_job(&handle.job_id, 5)
        .expect("poll")
        .job
        .stdout_tail
        .is_empty()
    {
        assert!(Instant::now() < deadline, "agent never started");
        std::thread::sleep(Duration::from_millis(10));
    }

    let canceled_at = Instant::now();
    assert!(orchestrator.cancel_job(&handle.job_id));
    assert!(!orchestrator.cancel_job(&handle.job_id));

    let completion = handle.completion.recv_timeout(WAIT).expect("completion");
    assert!(canceled_at.elapsed() < Duration::from_secs(5));
    assert_eq!(completion.job.status(), JobStatus::Canceled);
    assert_eq!(completion.outcome, RunOutcome::Canceled);
    assert!(!orchestrator.cancel_job(&handle.job_id));

    let view = orchestrator.poll_job(&handle.job_id, 5).expect("poll");
    assert_eq!(view.job.status(), JobStatus::Canceled);
    assert_eq!(view.outcome, Some(RunOutcome::Canceled));
}

#[test]
fn timed_out_run_is_a_process_failure() {
    let ws = TestWorkspace::new();
    let agent = ScriptedInvoker::sleeping(30).with_timeout(Duration::from_millis(300));
    let orchestrator = ws.orchestrator(Arc::new(agent));

    let started = Instant::now();
    let handle = orchestrator
        .start_insights(request(RunMode::Fork))
        .expect("start");
    let completion = handle.completion.recv_timeout(WAIT).expect("completion");

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        completion.job.state,
        JobState::Failed {
            reason: FailureReason::TimedOut,
            ..
        }
    ));
    assert_eq!(completion.outcome, RunOutcome::ProcessFailed);
    assert_eq!(completion.errors[0], "job timed out");
}
