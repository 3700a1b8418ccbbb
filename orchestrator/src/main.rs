//! `codex-orchestrator`: turn agent conversations into reviewable instruction
//! and skill changes.
//!
//! Artifacts live under `.codex-orchestrator/` in the repository root. Every
//! command prints JSON on stdout and uses the exit codes in
//! [`codex_orchestrator::exit_codes`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use codex_orchestrator::core::ids::{ArtifactId, JobId, ProposalId, SessionId};
use codex_orchestrator::core::run::{RunMode, RunOutcome};
use codex_orchestrator::core::validator::validate_diff;
use codex_orchestrator::exit_codes;
use codex_orchestrator::insights::InsightsRequest;
use codex_orchestrator::io::config::{config_path, find_repo_root, load_config};
use codex_orchestrator::io::init::{InitOptions, init_workspace};
use codex_orchestrator::io::sessions::SessionQuery;
use codex_orchestrator::logging;
use codex_orchestrator::orchestrator::{Orchestrator, WorkflowCompletion};
use codex_orchestrator::proposals::ProposalRequest;

#[derive(Parser)]
#[command(
    name = "codex-orchestrator",
    version,
    about = "Turn agent conversation history into reviewable instruction and skill changes"
)]
struct Cli {
    /// Repository root (defaults to the nearest ancestor containing `.git`).
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the config, artifact directories and output schemas.
    Init {
        /// Overwrite an existing config with defaults.
        #[arg(short, long)]
        force: bool,
    },
    /// Browse recorded agent sessions.
    #[command(subcommand)]
    Sessions(SessionsCommand),
    /// Analyze a session into an insight artifact.
    #[command(subcommand)]
    Insights(InsightsCommand),
    /// Generate, inspect and apply diff proposals.
    #[command(subcommand)]
    Proposals(ProposalsCommand),
    /// Print the audit record of a job.
    Run { job_id: String },
    /// Check a diff file against the validation policy.
    ValidateDiff { file: PathBuf },
}

#[derive(Subcommand)]
enum SessionsCommand {
    /// Sessions for this repository, newest first.
    List {
        /// Include sessions recorded in other directories.
        #[arg(long)]
        all_repos: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// One session with its messages.
    Show { session_id: String },
}

#[derive(Subcommand)]
enum InsightsCommand {
    /// Run the analysis agent and wait for the artifact.
    Run {
        session_id: String,
        #[arg(short, long)]
        prompt: String,
        #[arg(long, default_value = "fork")]
        mode: RunMode,
        #[arg(long)]
        model: Option<String>,
    },
    /// Artifacts stored for a session.
    List { session_id: String },
    /// Print one artifact.
    Show {
        session_id: String,
        artifact_id: String,
        /// Print only the markdown document.
        #[arg(long)]
        markdown: bool,
    },
}

#[derive(Subcommand)]
enum ProposalsCommand {
    /// Generate a diff proposal from an insight artifact and wait for it.
    Run {
        session_id: String,
        artifact_id: String,
        #[arg(short, long)]
        prompt: Option<String>,
        #[arg(long, default_value = "fork")]
        mode: RunMode,
        #[arg(long)]
        model: Option<String>,
    },
    /// Print a proposal record.
    Show {
        proposal_id: String,
        /// Print only the diff.
        #[arg(long)]
        diff: bool,
    },
    /// Apply a ready proposal to the working tree.
    Apply {
        proposal_id: String,
        /// Required; nothing is written without it.
        #[arg(long)]
        confirm: bool,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let repo_root = match cli.repo {
        Some(repo) => repo,
        None => find_repo_root(&std::env::current_dir().context("read current directory")?),
    };
    match cli.command {
        Command::Init { force } => cmd_init(&repo_root, force),
        Command::Sessions(cmd) => cmd_sessions(&open(&repo_root)?, cmd),
        Command::Insights(cmd) => cmd_insights(&open(&repo_root)?, cmd),
        Command::Proposals(cmd) => cmd_proposals(&open(&repo_root)?, cmd),
        Command::Run { job_id } => {
            let orchestrator = open(&repo_root)?;
            print_json(&orchestrator.store().get_run(&JobId::parse(&job_id)?)?)?;
            Ok(exit_codes::OK)
        }
        Command::ValidateDiff { file } => cmd_validate_diff(&repo_root, &file),
    }
}

fn open(repo_root: &Path) -> Result<Orchestrator> {
    Orchestrator::from_repo(repo_root)
}

fn cmd_init(repo_root: &Path, force: bool) -> Result<i32> {
    let report = init_workspace(repo_root, &InitOptions { force })?;
    print_json(&json!({
        "config_path": report.config_path,
        "artifacts_root": report.artifacts_root,
        "wrote_config": report.wrote_config,
    }))?;
    Ok(exit_codes::OK)
}

fn cmd_sessions(orchestrator: &Orchestrator, cmd: SessionsCommand) -> Result<i32> {
    match cmd {
        SessionsCommand::List { all_repos, limit } => {
            let sessions = orchestrator.sessions().list_sessions(&SessionQuery {
                repo_root: Some(orchestrator.repo_root().to_path_buf()),
                include_all_repos: all_repos,
                limit,
            })?;
            print_json(&sessions)?;
        }
        SessionsCommand::Show { session_id } => {
            let detail = orchestrator
                .sessions()
                .get_session(&SessionId::parse(&session_id)?)?;
            print_json(&detail)?;
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_insights(orchestrator: &Orchestrator, cmd: InsightsCommand) -> Result<i32> {
    match cmd {
        InsightsCommand::Run {
            session_id,
            prompt,
            mode,
            model,
        } => {
            let handle = orchestrator.start_insights(InsightsRequest {
                session_id: SessionId::parse(&session_id)?,
                prompt,
                mode,
                model,
            })?;
            eprintln!("job {} started", handle.job_id);
            let completion = handle
                .completion
                .recv()
                .context("insights job ended without a result")?;
            print_json(&json!({
                "job_id": handle.job_id,
                "artifact_id": handle.artifact_id,
                "status": completion.job.status(),
                "outcome": completion.outcome,
                "errors": completion.errors,
            }))?;
            Ok(job_exit_code(&completion))
        }
        InsightsCommand::List { session_id } => {
            print_json(
                &orchestrator
                    .store()
                    .list_insights(&SessionId::parse(&session_id)?)?,
            )?;
            Ok(exit_codes::OK)
        }
        InsightsCommand::Show {
            session_id,
            artifact_id,
            markdown,
        } => {
            let artifact = orchestrator.store().get_insight(
                &SessionId::parse(&session_id)?,
                &ArtifactId::parse(&artifact_id)?,
            )?;
            if markdown {
                print!("{}", artifact.markdown.unwrap_or_default());
            } else {
                print_json(&artifact)?;
            }
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_proposals(orchestrator: &Orchestrator, cmd: ProposalsCommand) -> Result<i32> {
    match cmd {
        ProposalsCommand::Run {
            session_id,
            artifact_id,
            prompt,
            mode,
            model,
        } => {
            let handle = orchestrator.start_proposal(ProposalRequest {
                session_id: SessionId::parse(&session_id)?,
                insight_artifact_id: ArtifactId::parse(&artifact_id)?,
                prompt,
                mode,
                model,
            })?;
            eprintln!("job {} started", handle.job_id);
            let completion = handle
                .completion
                .recv()
                .context("proposal job ended without a result")?;
            let proposal = orchestrator.get_proposal(&handle.proposal_id)?;
            print_json(&json!({
                "job_id": handle.job_id,
                "proposal_id": handle.proposal_id,
                "status": completion.job.status(),
                "outcome": completion.outcome,
                "proposal_status": proposal.status(),
                "validation_errors": proposal.validation_errors(),
                "errors": completion.errors,
            }))?;
            if completion.outcome == RunOutcome::Stored && !proposal.validation_errors().is_empty()
            {
                return Ok(exit_codes::BLOCKED);
            }
            Ok(job_exit_code(&completion))
        }
        ProposalsCommand::Show { proposal_id, diff } => {
            let proposal = orchestrator.get_proposal(&ProposalId::parse(&proposal_id)?)?;
            if diff {
                print!("{}", proposal.diff().unwrap_or_default());
            } else {
                print_json(&proposal)?;
            }
            Ok(exit_codes::OK)
        }
        ProposalsCommand::Apply {
            proposal_id,
            confirm,
        } => {
            let outcome =
                orchestrator.apply_proposal(&ProposalId::parse(&proposal_id)?, confirm)?;
            print_json(&outcome)?;
            Ok(if outcome.applied {
                exit_codes::OK
            } else {
                exit_codes::BLOCKED
            })
        }
    }
}

/// Validate without opening the orchestrator: only the config is needed.
fn cmd_validate_diff(repo_root: &Path, file: &Path) -> Result<i32> {
    let config = load_config(&config_path(repo_root))?;
    let policy = config.validation_policy()?;
    let diff = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let report = validate_diff(&diff, &policy);
    print_json(&json!({
        "valid": report.is_valid(),
        "files_touched": report.files_touched,
        "violations": report.violations,
        "validation_errors": report.messages(),
    }))?;
    Ok(if report.is_valid() {
        exit_codes::OK
    } else {
        exit_codes::BLOCKED
    })
}

fn job_exit_code(completion: &WorkflowCompletion) -> i32 {
    if completion.outcome == RunOutcome::Stored {
        exit_codes::OK
    } else {
        exit_codes::JOB_FAILED
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["codex-orchestrator", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_insights_run_defaults_to_fork() {
        let cli = Cli::parse_from(["codex-orchestrator", "insights", "run", "abc", "-p", "why?"]);
        match cli.command {
            Command::Insights(InsightsCommand::Run { mode, prompt, .. }) => {
                assert_eq!(mode, RunMode::Fork);
                assert_eq!(prompt, "why?");
            }
            _ => panic!("expected insights run"),
        }
    }

    #[test]
    fn parse_apply_requires_explicit_flag() {
        let cli = Cli::parse_from(["codex-orchestrator", "proposals", "apply", "p1"]);
        assert!(matches!(
            cli.command,
            Command::Proposals(ProposalsCommand::Apply { confirm: false, .. })
        ));
    }

    #[test]
    fn rejects_unknown_mode() {
        let parsed = Cli::try_parse_from([
            "codex-orchestrator",
            "insights",
            "run",
            "abc",
            "-p",
            "x",
            "--mode",
            "branch",
        ]);
        assert!(parsed.is_err());
    }
}
