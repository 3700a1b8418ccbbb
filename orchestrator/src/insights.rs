//! Insights workflow: `(session, prompt, mode)` to a stored insight artifact.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::ids::{ArtifactId, JobId, SessionId};
use crate::core::insight::InsightDraft;
use crate::core::job::{Job, JobStatus};
use crate::core::output::parse_insights_output;
use crate::core::run::{RunEntry, RunInputs, RunKind, RunMode, RunOutcome, RunOutputs};
use crate::error::OrchestratorResult;
use crate::io::artifact_store::ArtifactStore;
use crate::io::invoker::{AgentRequest, read_last_message};
use crate::io::prompt::InsightsPrompt;
use crate::orchestrator::{Orchestrator, WorkflowCompletion, require_prompt, unsuccessful};

#[derive(Debug, Clone)]
pub struct InsightsRequest {
    pub session_id: SessionId,
    pub prompt: String,
    pub mode: RunMode,
    pub model: Option<String>,
}

/// Ids for a started insights run. `completion` yields once the artifact has
/// been stored or the run has been recorded as failed.
pub struct InsightsHandle {
    pub job_id: JobId,
    pub artifact_id: ArtifactId,
    pub completion: Receiver<WorkflowCompletion>,
}

struct PendingInsight {
    store: Arc<ArtifactStore>,
    session_id: SessionId,
    artifact_id: ArtifactId,
    last_message_path: PathBuf,
}

impl Orchestrator {
    /// Start an insights job and return without waiting for it.
    ///
    /// The session must exist; in fork mode its transcript is embedded in the
    /// prompt. The artifact id is chosen up front and only becomes readable
    /// once the job succeeds with schema-valid output.
    #[instrument(skip_all, fields(session_id = %request.session_id, mode = %request.mode))]
    pub fn start_insights(&self, request: InsightsRequest) -> OrchestratorResult<InsightsHandle> {
        require_prompt(&request.prompt)?;
        let transcript = self.transcript_for(&request.session_id, request.mode)?;
        let prompt = self.prompts.render_insights(
            &InsightsPrompt {
                prompt: &request.prompt,
                transcript: transcript.as_deref(),
            },
            &self.policy.root_instructions,
        )?;

        self.store.write_schemas()?;
        let job_id = JobId::generate();
        let artifact_id = ArtifactId::generate();
        let last_message_path = self.store.last_message_path(&job_id);
        let spec = self.invoker.prepare(&AgentRequest {
            prompt,
            mode: request.mode,
            session_id: request.session_id.clone(),
            workdir: self.repo_root.clone(),
            output_schema_path: self.store.insights_schema_path(),
            last_message_path: last_message_path.clone(),
            model: request.model.clone(),
        })?;
        let command = spec.command.clone();
        let workdir = spec.workdir.clone();
        self.runner.start_with_id(job_id.clone(), spec)?;

        let started = RunEntry::Started {
            at: Utc::now(),
            job_id: job_id.clone(),
            kind: RunKind::Insights,
            inputs: RunInputs {
                session_id: request.session_id.clone(),
                mode: request.mode,
                prompt: Some(request.prompt),
                insight_artifact_id: None,
            },
            outputs: RunOutputs {
                artifact_id: Some(artifact_id.clone()),
                proposal_id: None,
            },
            command,
            workdir,
        };
        if let Err(err) = self.store.record_run(&started) {
            self.runner.cancel(&job_id);
            return Err(err);
        }

        let pending = PendingInsight {
            store: Arc::clone(&self.store),
            session_id: request.session_id,
            artifact_id: artifact_id.clone(),
            last_message_path,
        };
        let (tx, rx) = mpsc::channel();
        self.runner.await_completion(&job_id, move |job| {
            let job_id = job.id.clone();
            if tx.send(pending.complete(job)).is_err() {
                debug!(job_id = %job_id, "insights completion dropped, handle no longer held");
            }
        })?;
        info!(job_id = %job_id, artifact_id = %artifact_id, "insights job started");

        Ok(InsightsHandle {
            job_id,
            artifact_id,
            completion: rx,
        })
    }
}

impl PendingInsight {
    fn complete(self, job: Job) -> WorkflowCompletion {
        let (outcome, errors) = if job.status() == JobStatus::Succeeded {
            self.store_output()
        } else {
            unsuccessful(&job)
        };

        let finished = RunEntry::Finished {
            at: Utc::now(),
            job_id: job.id.clone(),
            status: job.status(),
            returncode: job.returncode(),
            outcome,
            errors: errors.clone(),
        };
        if let Err(err) = self.store.record_run(&finished) {
            warn!(job_id = %job.id, err = %err, "failed to record run completion");
        }
        info!(job_id = %job.id, outcome = outcome.as_str(), "insights run finished");
        WorkflowCompletion {
            job,
            outcome,
            errors,
        }
    }

    fn store_output(&self) -> (RunOutcome, Vec<String>) {
        let raw = match read_last_message(&self.last_message_path) {
            Ok(raw) => raw,
            Err(err) => return (RunOutcome::StoreFailed, vec![format!("{err:#}")]),
        };
        let output = match parse_insights_output(raw.as_deref()) {
            Ok(output) => output,
            Err(violation) => return (RunOutcome::SchemaViolation, violation.messages),
        };
        let draft = InsightDraft {
            artifact_id: Some(self.artifact_id.clone()),
            markdown: output.markdown,
            json: Some(output.json),
        };
        match self.store.put_insight(&self.session_id, draft) {
            Ok(_) => (RunOutcome::Stored, Vec::new()),
            Err(err) => (RunOutcome::StoreFailed, vec![err.to_string()]),
        }
    }
}
