//! Probes of `codex exec` as the orchestrator invokes it: the argv built by
//! [`CodexInvoker`], the prompt on stdin, `--output-schema` and `-o`.
//!
//! ```bash
//! cargo test --test investigation codex_cli_available -- --ignored
//! ```

use std::process::Command;
use std::time::Duration;

use codex_orchestrator::core::ids::{JobId, SessionId};
use codex_orchestrator::core::job::JobStatus;
use codex_orchestrator::core::output::{parse_insights_output, parse_proposal_output};
use codex_orchestrator::core::run::RunMode;
use codex_orchestrator::io::artifact_store::ArtifactStore;
use codex_orchestrator::io::config::OrchestratorConfig;
use codex_orchestrator::io::invoker::{AgentInvoker, AgentRequest, CodexInvoker, read_last_message};
use codex_orchestrator::io::job_runner::{JobRunner, RunnerSettings};

/// LLM latency varies; give each call a few minutes.
const CODEX_TIMEOUT: Duration = Duration::from_secs(300);

#[test]
#[ignore]
fn codex_cli_available() {
    let output = Command::new("codex")
        .arg("--version")
        .output()
        .expect("codex not in PATH");
    assert!(
        output.status.success(),
        "codex --version failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    println!("codex: {}", String::from_utf8_lossy(&output.stdout).trim());
}

/// Run `codex exec` against the proposal (or insights) schema and return the final message.
fn run_codex(prompt: &str, proposal: bool) -> Option<String> {
    let repo = tempfile::tempdir().expect("tempdir");
    std::fs::write(repo.path().join("AGENTS.md"), "# Agent rules\n").expect("write");
    let config = OrchestratorConfig::default();
    let store = ArtifactStore::new(config.artifacts_root(repo.path()));
    store.write_schemas().expect("schemas");

    let mut agent = config.agent.clone();
    agent.skip_git_repo_check = true;
    let invoker = CodexInvoker::new(agent, config.codex_home(repo.path()), Some(CODEX_TIMEOUT));
    let job_id = JobId::generate();
    let request = AgentRequest {
        prompt: prompt.to_string(),
        mode: RunMode::Fork,
        session_id: SessionId::parse("investigation").expect("id"),
        workdir: repo.path().to_path_buf(),
        output_schema_path: if proposal {
            store.proposal_schema_path()
        } else {
            store.insights_schema_path()
        },
        last_message_path: store.last_message_path(&job_id),
        model: None,
    };
    let spec = invoker.prepare(&request).expect("prepare");
    println!("argv: {:?}", spec.command);

    let runner = JobRunner::new(RunnerSettings::default());
    runner.start_with_id(job_id.clone(), spec).expect("start");
    let job = runner
        .wait(&job_id, Some(CODEX_TIMEOUT + Duration::from_secs(10)))
        .expect("wait");
    assert_eq!(
        job.status(),
        JobStatus::Succeeded,
        "stderr: {:?}",
        job.stderr_tail
    );
    println!("events: {}", job.events_tail.len());
    read_last_message(&request.last_message_path).expect("read last message")
}

#[test]
#[ignore]
fn insights_schema_is_honored() {
    let raw = run_codex(
        "Summarize this conversation: the user asked three times where the database \
         schema lives. Put a short markdown summary in insights_markdown.",
        false,
    );
    let output = parse_insights_output(raw.as_deref()).expect("schema-valid insights");
    assert!(output.markdown.is_some());
}

#[test]
#[ignore]
fn proposal_schema_is_honored() {
    let raw = run_codex(
        "Propose a unified diff that appends the line '- Ask before deleting files.' \
         to AGENTS.md. Do not edit any files yourself.",
        true,
    );
    let output = parse_proposal_output(raw.as_deref()).expect("schema-valid proposal");
    assert!(output.diff.contains("AGENTS.md"));
}
