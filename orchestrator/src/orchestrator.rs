//! The orchestrator facade: one value that owns the job registry, the artifact
//! store and the collaborators, injected into every workflow.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::ids::{JobId, SessionId};
use crate::core::job::{FailureReason, Job, JobState};
use crate::core::run::{RunEntry, RunMode, RunOutcome};
use crate::core::validator::ValidationPolicy;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::io::artifact_store::ArtifactStore;
use crate::io::config::{OrchestratorConfig, config_path, load_config};
use crate::io::invoker::{AgentInvoker, CodexInvoker};
use crate::io::job_runner::{JobRunner, RunnerSettings};
use crate::io::prompt::PromptEngine;
use crate::io::sessions::{CodexSessionStore, SessionStore, render_transcript};

/// Stderr lines copied into a failed run's error list.
const STDERR_ERROR_LINES: usize = 20;

/// What a workflow did with its job, delivered once per run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowCompletion {
    pub job: Job,
    pub outcome: RunOutcome,
    pub errors: Vec<String>,
}

/// Job snapshot plus the workflow outcome once it has been recorded.
///
/// `outcome` stays `None` while the job runs and until the completion hook has
/// persisted (or rejected) its output, so a poller that sees it set can fetch
/// the artifact right away.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub outcome: Option<RunOutcome>,
    pub errors: Vec<String>,
}

pub struct Orchestrator {
    pub(crate) repo_root: PathBuf,
    pub(crate) config: OrchestratorConfig,
    pub(crate) store: Arc<ArtifactStore>,
    pub(crate) runner: JobRunner,
    pub(crate) invoker: Arc<dyn AgentInvoker>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) prompts: Arc<PromptEngine>,
    pub(crate) policy: Arc<ValidationPolicy>,
    apply_lock: Mutex<()>,
}

impl Orchestrator {
    /// Wire an orchestrator from explicit collaborators.
    pub fn new(
        repo_root: PathBuf,
        config: OrchestratorConfig,
        invoker: Arc<dyn AgentInvoker>,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        config.validate()?;
        let policy = config.validation_policy()?;
        let store = ArtifactStore::new(config.artifacts_root(&repo_root));
        let runner = JobRunner::new(RunnerSettings::from(&config.jobs));
        Ok(Self {
            repo_root,
            store: Arc::new(store),
            runner,
            invoker,
            sessions,
            prompts: Arc::new(PromptEngine::new()?),
            policy: Arc::new(policy),
            config,
            apply_lock: Mutex::new(()),
        })
    }

    /// Load `<repo_root>/.codex-orchestrator/config.toml` (defaults when
    /// missing) and use the `codex` CLI plus its on-disk sessions.
    pub fn from_repo(repo_root: &Path) -> Result<Self> {
        let config = load_config(&config_path(repo_root))
            .with_context(|| format!("load config for {}", repo_root.display()))?;
        let codex_home = config.codex_home(repo_root);
        let invoker = CodexInvoker::new(
            config.agent.clone(),
            codex_home.clone(),
            config.jobs.timeout(),
        );
        Self::new(
            repo_root.to_path_buf(),
            config,
            Arc::new(invoker),
            Arc::new(CodexSessionStore::new(codex_home)),
        )
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    pub fn sessions(&self) -> &dyn SessionStore {
        self.sessions.as_ref()
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Poll a job. Unknown ids are `NotFound`.
    pub fn poll_job(&self, job_id: &JobId, tail_n: usize) -> OrchestratorResult<JobView> {
        let job = self.runner.get_status(job_id, tail_n)?;
        let finished = match self.store.get_run(job_id) {
            Ok(entries) => entries.into_iter().rev().find_map(|entry| match entry {
                RunEntry::Finished {
                    outcome, errors, ..
                } => Some((outcome, errors)),
                RunEntry::Started { .. } => None,
            }),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };
        let (outcome, errors) = match finished {
            Some((outcome, errors)) => (Some(outcome), errors),
            None => (None, Vec::new()),
        };
        Ok(JobView {
            job,
            outcome,
            errors,
        })
    }

    /// Request cancellation; see [`JobRunner::cancel`].
    pub fn cancel_job(&self, job_id: &JobId) -> bool {
        self.runner.cancel(job_id)
    }

    pub(crate) fn lock_apply(&self) -> MutexGuard<'_, ()> {
        self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transcript for fork mode; resume mode hands the session to the agent
    /// instead. Either way the session must exist before a job is started.
    pub(crate) fn transcript_for(
        &self,
        session_id: &SessionId,
        mode: RunMode,
    ) -> OrchestratorResult<Option<String>> {
        let detail = self.sessions.get_session(session_id)?;
        Ok(match mode {
            RunMode::Fork => Some(render_transcript(
                &detail.messages,
                self.config.transcript_max_chars,
            )),
            RunMode::Resume => None,
        })
    }
}

/// Reject an empty or whitespace-only prompt.
pub(crate) fn require_prompt(prompt: &str) -> OrchestratorResult<()> {
    if prompt.trim().is_empty() {
        return Err(OrchestratorError::precondition("prompt is empty"));
    }
    Ok(())
}

/// Outcome and error list for a job that did not succeed.
pub(crate) fn unsuccessful(job: &Job) -> (RunOutcome, Vec<String>) {
    let mut errors = Vec::new();
    let outcome = match &job.state {
        JobState::Canceled { .. } => {
            errors.push("job canceled".to_string());
            RunOutcome::Canceled
        }
        JobState::Failed {
            reason, returncode, ..
        } => {
            errors.push(match (reason, returncode) {
                (FailureReason::TimedOut, _) => "job timed out".to_string(),
                (FailureReason::WaitError, _) => "lost track of the job process".to_string(),
                (FailureReason::Exit, Some(code)) => format!("process exited with code {code}"),
                (FailureReason::Exit, None) => "process exited abnormally".to_string(),
            });
            RunOutcome::ProcessFailed
        }
        JobState::Queued | JobState::Running { .. } | JobState::Succeeded { .. } => {
            errors.push(format!("job finished as {}", job.status().as_str()));
            RunOutcome::ProcessFailed
        }
    };
    let skip = job.stderr_tail.len().saturating_sub(STDERR_ERROR_LINES);
    errors.extend(job.stderr_tail.iter().skip(skip).cloned());
    (outcome, errors)
}
