//! Proposal workflow: `(session, insight artifact, prompt?)` to a validated
//! diff proposal.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::ids::{ArtifactId, JobId, ProposalId, SessionId};
use crate::core::job::{Job, JobStatus};
use crate::core::output::parse_proposal_output;
use crate::core::proposal::{Proposal, ProposalContent};
use crate::core::run::{
    ProposalAuditEntry, RunEntry, RunInputs, RunKind, RunMode, RunOutcome, RunOutputs,
};
use crate::core::validator::{ValidationPolicy, validate_diff};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::io::artifact_store::ArtifactStore;
use crate::io::invoker::{AgentRequest, read_last_message};
use crate::io::prompt::ProposalPrompt;
use crate::orchestrator::{Orchestrator, WorkflowCompletion, unsuccessful};

#[derive(Debug, Clone)]
pub struct ProposalRequest {
    pub session_id: SessionId,
    pub insight_artifact_id: ArtifactId,
    pub prompt: Option<String>,
    pub mode: RunMode,
    pub model: Option<String>,
}

pub struct ProposalHandle {
    pub job_id: JobId,
    pub proposal_id: ProposalId,
    pub completion: Receiver<WorkflowCompletion>,
}

struct PendingProposal {
    store: Arc<ArtifactStore>,
    policy: Arc<ValidationPolicy>,
    proposal_id: ProposalId,
    last_message_path: PathBuf,
}

impl Orchestrator {
    /// Start a proposal job.
    ///
    /// The insight artifact and the session are checked before anything is
    /// spawned; a missing artifact is a precondition failure. The proposal
    /// record is created as `missing` and turns `ready` when the job produces a
    /// schema-valid diff (validation errors are attached, not fatal).
    #[instrument(skip_all, fields(session_id = %request.session_id, insight = %request.insight_artifact_id))]
    pub fn start_proposal(&self, request: ProposalRequest) -> OrchestratorResult<ProposalHandle> {
        let insight = match self
            .store
            .get_insight(&request.session_id, &request.insight_artifact_id)
        {
            Ok(insight) => insight,
            Err(err) if err.is_not_found() => {
                return Err(OrchestratorError::precondition(format!(
                    "insight artifact {}/{} does not exist",
                    request.session_id, request.insight_artifact_id
                )));
            }
            Err(err) => return Err(err),
        };
        let insight_json = insight
            .json
            .clone()
            .unwrap_or_else(|| json!({ "insights_markdown": insight.markdown }));

        let transcript = self.transcript_for(&request.session_id, request.mode)?;
        let prompt = self.prompts.render_proposal(&ProposalPrompt {
            prompt: request.prompt.as_deref(),
            insight: &insight_json,
            transcript: transcript.as_deref(),
            policy: &self.policy,
        })?;

        self.store.write_schemas()?;
        let job_id = JobId::generate();
        let proposal_id = ProposalId::generate();
        let last_message_path = self.store.last_message_path(&job_id);
        let spec = self.invoker.prepare(&AgentRequest {
            prompt,
            mode: request.mode,
            session_id: request.session_id.clone(),
            workdir: self.repo_root.clone(),
            output_schema_path: self.store.proposal_schema_path(),
            last_message_path: last_message_path.clone(),
            model: request.model.clone(),
        })?;
        let command = spec.command.clone();
        let workdir = spec.workdir.clone();
        self.runner.start_with_id(job_id.clone(), spec)?;

        let proposal = Proposal::new(
            proposal_id.clone(),
            request.session_id.clone(),
            request.insight_artifact_id.clone(),
            Some(job_id.clone()),
        );
        let recorded = self
            .store
            .put_proposal(&proposal)
            .and_then(|_| {
                self.store.append_proposal_audit(
                    &proposal_id,
                    &ProposalAuditEntry::Created {
                        at: Utc::now(),
                        job_id: job_id.clone(),
                    },
                )
            })
            .and_then(|()| {
                self.store.record_run(&RunEntry::Started {
                    at: Utc::now(),
                    job_id: job_id.clone(),
                    kind: RunKind::Proposal,
                    inputs: RunInputs {
                        session_id: request.session_id.clone(),
                        mode: request.mode,
                        prompt: request.prompt.clone(),
                        insight_artifact_id: Some(request.insight_artifact_id.clone()),
                    },
                    outputs: RunOutputs {
                        artifact_id: None,
                        proposal_id: Some(proposal_id.clone()),
                    },
                    command,
                    workdir,
                })
            });
        if let Err(err) = recorded {
            self.runner.cancel(&job_id);
            return Err(err);
        }

        let pending = PendingProposal {
            store: Arc::clone(&self.store),
            policy: Arc::clone(&self.policy),
            proposal_id: proposal_id.clone(),
            last_message_path,
        };
        let (tx, rx) = mpsc::channel();
        self.runner.await_completion(&job_id, move |job| {
            let job_id = job.id.clone();
            if tx.send(pending.complete(job)).is_err() {
                debug!(job_id = %job_id, "proposal completion dropped, handle no longer held");
            }
        })?;
        info!(job_id = %job_id, proposal_id = %proposal_id, "proposal job started");

        Ok(ProposalHandle {
            job_id,
            proposal_id,
            completion: rx,
        })
    }

    pub fn get_proposal(&self, proposal_id: &ProposalId) -> OrchestratorResult<Proposal> {
        self.store.get_proposal(proposal_id)
    }
}

impl PendingProposal {
    fn complete(self, job: Job) -> WorkflowCompletion {
        let (outcome, errors) = if job.status() == JobStatus::Succeeded {
            self.store_output(&job.id)
        } else {
            unsuccessful(&job)
        };

        if outcome != RunOutcome::Stored {
            let failed = ProposalAuditEntry::GenerationFailed {
                at: Utc::now(),
                job_id: job.id.clone(),
                outcome,
                errors: errors.clone(),
            };
            if let Err(err) = self.store.append_proposal_audit(&self.proposal_id, &failed) {
                warn!(proposal_id = %self.proposal_id, err = %err, "failed to append audit entry");
            }
        }
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
        info!(job_id = %job.id, outcome = outcome.as_str(), "proposal run finished");
        WorkflowCompletion {
            job,
            outcome,
            errors,
        }
    }

    /// Parse, validate and attach the generated diff. Validation failures are
    /// stored on the proposal and reported as errors of a `stored` run.
    fn store_output(&self, job_id: &JobId) -> (RunOutcome, Vec<String>) {
        let raw = match read_last_message(&self.last_message_path) {
            Ok(raw) => raw,
            Err(err) => return (RunOutcome::StoreFailed, vec![format!("{err:#}")]),
        };
        let output = match parse_proposal_output(raw.as_deref()) {
            Ok(output) => output,
            Err(violation) => return (RunOutcome::SchemaViolation, violation.messages),
        };

        let report = validate_diff(&output.diff, &self.policy);
        let mut claimed = output.files_touched.clone();
        claimed.sort();
        claimed.dedup();
        if claimed != report.files_touched {
            warn!(
                proposal_id = %self.proposal_id,
                claimed = ?claimed,
                derived = ?report.files_touched,
                "agent's files_touched differs from the diff"
            );
        }
        let validation_errors = report.messages();
        let content = ProposalContent {
            diff: output.diff,
            summary: Some(output.summary.trim().to_string()).filter(|s| !s.is_empty()),
            files_touched: report.files_touched.clone(),
            validation_errors: validation_errors.clone(),
            safety_notes: output.safety_notes,
        };
        if let Err(err) = self
            .store
            .update_proposal(&self.proposal_id, |proposal| proposal.mark_ready(content))
        {
            return (RunOutcome::StoreFailed, vec![err.to_string()]);
        }

        let generated = ProposalAuditEntry::Generated {
            at: Utc::now(),
            job_id: job_id.clone(),
            files_touched: report.files_touched,
            validation_errors: validation_errors.clone(),
        };
        if let Err(err) = self.store.append_proposal_audit(&self.proposal_id, &generated) {
            warn!(proposal_id = %self.proposal_id, err = %err, "failed to append audit entry");
        }
        (RunOutcome::Stored, validation_errors)
    }
}
