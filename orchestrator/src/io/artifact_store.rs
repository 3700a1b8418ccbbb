//! On-disk artifact store.
//!
//! Layout under the artifacts root:
//!
//! ```text
//! schemas/{insights,proposal}.schema.json
//! insights/<session_id>/<artifact_id>.md          primary document
//! insights/<session_id>/<artifact_id>.json        structured payload
//! insights/<session_id>/<artifact_id>.meta.json   sidecar, written last
//! proposals/<proposal_id>/proposal.diff           primary document
//! proposals/<proposal_id>/proposal.json           record, replaced atomically
//! proposals/<proposal_id>/audit.jsonl             append-only history
//! runs/<job_id>.jsonl                             append-only run record
//! jobs/<job_id>/last_message.json                 agent's final message
//! ```
//!
//! Every file is written temp-then-rename. An insight exists once its meta
//! sidecar exists; a proposal exists once `proposal.json` exists.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::core::ids::{ArtifactId, JobId, ProposalId, SessionId};
use crate::core::insight::{InsightArtifact, InsightDraft, InsightSummary, content_digest};
use crate::core::output::{INSIGHTS_SCHEMA, PROPOSAL_SCHEMA};
use crate::core::proposal::Proposal;
use crate::core::run::{ProposalAuditEntry, RunEntry};
use crate::error::{OrchestratorError, OrchestratorResult, RecordKind};
use crate::io::atomic::{
    append_json_line, read_json, read_json_lines, write_atomic, write_json_atomic,
};

pub const INSIGHTS_SCHEMA_FILE: &str = "insights.schema.json";
pub const PROPOSAL_SCHEMA_FILE: &str = "proposal.schema.json";

/// Sidecar for an insight artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct InsightMeta {
    artifact_id: ArtifactId,
    session_id: SessionId,
    created_at: DateTime<Utc>,
    has_markdown: bool,
    has_json: bool,
    sha256: String,
}

impl From<&InsightMeta> for InsightSummary {
    fn from(meta: &InsightMeta) -> Self {
        Self {
            artifact_id: meta.artifact_id.clone(),
            session_id: meta.session_id.clone(),
            created_at: meta.created_at,
            has_markdown: meta.has_markdown,
            has_json: meta.has_json,
        }
    }
}

/// File-backed store for insights, proposals and run records.
pub struct ArtifactStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schemas_dir(&self) -> PathBuf {
        self.root.join("schemas")
    }

    pub fn insights_schema_path(&self) -> PathBuf {
        self.schemas_dir().join(INSIGHTS_SCHEMA_FILE)
    }

    pub fn proposal_schema_path(&self) -> PathBuf {
        self.schemas_dir().join(PROPOSAL_SCHEMA_FILE)
    }

    fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        self.root.join("insights").join(session_id.as_str())
    }

    fn insight_path(&self, session_id: &SessionId, artifact_id: &ArtifactId, ext: &str) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{artifact_id}.{ext}"))
    }

    pub fn proposal_dir(&self, proposal_id: &ProposalId) -> PathBuf {
        self.root.join("proposals").join(proposal_id.as_str())
    }

    fn proposal_record_path(&self, proposal_id: &ProposalId) -> PathBuf {
        self.proposal_dir(proposal_id).join("proposal.json")
    }

    pub fn proposal_diff_path(&self, proposal_id: &ProposalId) -> PathBuf {
        self.proposal_dir(proposal_id).join("proposal.diff")
    }

    fn proposal_audit_path(&self, proposal_id: &ProposalId) -> PathBuf {
        self.proposal_dir(proposal_id).join("audit.jsonl")
    }

    fn run_path(&self, job_id: &JobId) -> PathBuf {
        self.root.join("runs").join(format!("{job_id}.jsonl"))
    }

    /// Where a job's agent writes its final message.
    pub fn last_message_path(&self, job_id: &JobId) -> PathBuf {
        self.root
            .join("jobs")
            .join(job_id.as_str())
            .join("last_message.json")
    }

    /// Write the embedded output schemas (idempotent).
    pub fn write_schemas(&self) -> OrchestratorResult<()> {
        for (path, contents) in [
            (self.insights_schema_path(), INSIGHTS_SCHEMA),
            (self.proposal_schema_path(), PROPOSAL_SCHEMA),
        ] {
            let current = fs::read_to_string(&path).ok();
            if current.as_deref() != Some(contents) {
                write_atomic(&path, contents.as_bytes())?;
            }
        }
        Ok(())
    }

    // ---- insights ----

    /// Store a new immutable insight artifact.
    ///
    /// Re-putting identical content under the same id is a no-op; different
    /// content under an existing id is a [`OrchestratorError::Conflict`].
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub fn put_insight(
        &self,
        session_id: &SessionId,
        draft: InsightDraft,
    ) -> OrchestratorResult<ArtifactId> {
        let artifact_id = draft.artifact_id.unwrap_or_else(ArtifactId::generate);
        let artifact =
            InsightArtifact::new(artifact_id.clone(), session_id.clone(), draft.markdown, draft.json);
        if !artifact.is_well_formed() {
            return Err(OrchestratorError::precondition(
                "insight artifact needs markdown or json",
            ));
        }
        let sha256 = content_digest(artifact.markdown.as_deref(), artifact.json.as_ref());

        let _guard = self.lock();
        let meta_path = self.insight_path(session_id, &artifact_id, "meta.json");
        if meta_path.exists() {
            let existing: InsightMeta = read_json(&meta_path)?;
            if existing.sha256 == sha256 {
                debug!(artifact_id = %artifact_id, "identical insight already stored");
                return Ok(artifact_id);
            }
            return Err(OrchestratorError::Conflict {
                kind: RecordKind::Insight,
                id: artifact_id.to_string(),
            });
        }

        if let Some(markdown) = &artifact.markdown {
            write_atomic(
                &self.insight_path(session_id, &artifact_id, "md"),
                markdown.as_bytes(),
            )?;
        }
        if let Some(json) = &artifact.json {
            write_json_atomic(&self.insight_path(session_id, &artifact_id, "json"), json)?;
        }
        let meta = InsightMeta {
            artifact_id: artifact_id.clone(),
            session_id: session_id.clone(),
            created_at: artifact.created_at,
            has_markdown: artifact.markdown.is_some(),
            has_json: artifact.json.is_some(),
            sha256,
        };
        write_json_atomic(&meta_path, &meta)?;
        info!(artifact_id = %artifact_id, "insight stored");
        Ok(artifact_id)
    }

    pub fn get_insight(
        &self,
        session_id: &SessionId,
        artifact_id: &ArtifactId,
    ) -> OrchestratorResult<InsightArtifact> {
        let meta_path = self.insight_path(session_id, artifact_id, "meta.json");
        if !meta_path.exists() {
            return Err(OrchestratorError::not_found(
                RecordKind::Insight,
                format!("{session_id}/{artifact_id}"),
            ));
        }
        let meta: InsightMeta = read_json(&meta_path)?;
        let markdown = if meta.has_markdown {
            let path = self.insight_path(session_id, artifact_id, "md");
            Some(fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?)
        } else {
            None
        };
        let json = if meta.has_json {
            Some(read_json(&self.insight_path(session_id, artifact_id, "json"))?)
        } else {
            None
        };
        Ok(InsightArtifact {
            artifact_id: meta.artifact_id,
            session_id: meta.session_id,
            markdown,
            json,
            created_at: meta.created_at,
        })
    }

    /// Artifacts stored for a session, newest first. Unknown sessions list empty.
    pub fn list_insights(&self, session_id: &SessionId) -> OrchestratorResult<Vec<InsightSummary>> {
        let dir = self.session_dir(session_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(".meta.json") {
                continue;
            }
            let meta: InsightMeta = read_json(&entry.path())?;
            summaries.push(InsightSummary::from(&meta));
        }
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.artifact_id.cmp(&b.artifact_id))
        });
        Ok(summaries)
    }

    // ---- proposals ----

    /// Create a proposal record. Fails with a conflict if the id is taken.
    #[instrument(skip_all, fields(proposal_id = %proposal.proposal_id))]
    pub fn put_proposal(&self, proposal: &Proposal) -> OrchestratorResult<ProposalId> {
        let _guard = self.lock();
        if self.proposal_record_path(&proposal.proposal_id).exists() {
            return Err(OrchestratorError::Conflict {
                kind: RecordKind::Proposal,
                id: proposal.proposal_id.to_string(),
            });
        }
        self.write_proposal(proposal)?;
        debug!(status = proposal.status().as_str(), "proposal created");
        Ok(proposal.proposal_id.clone())
    }

    pub fn get_proposal(&self, proposal_id: &ProposalId) -> OrchestratorResult<Proposal> {
        let path = self.proposal_record_path(proposal_id);
        if !path.exists() {
            return Err(OrchestratorError::not_found(
                RecordKind::Proposal,
                proposal_id.as_str(),
            ));
        }
        Ok(read_json(&path)?)
    }

    /// Read-modify-write under the store lock.
    ///
    /// `mutate` sees the current record; if it returns an error nothing is
    /// written. Concurrent updates are serialized, so of two callers attempting
    /// the same transition exactly one wins.
    #[instrument(skip_all, fields(proposal_id = %proposal_id))]
    pub fn update_proposal<F>(&self, proposal_id: &ProposalId, mutate: F) -> OrchestratorResult<Proposal>
    where
        F: FnOnce(&mut Proposal) -> OrchestratorResult<()>,
    {
        let _guard = self.lock();
        let mut proposal = self.get_proposal(proposal_id)?;
        let before = proposal.status();
        mutate(&mut proposal)?;
        self.write_proposal(&proposal)?;
        debug!(
            from = before.as_str(),
            to = proposal.status().as_str(),
            "proposal updated"
        );
        Ok(proposal)
    }

    fn write_proposal(&self, proposal: &Proposal) -> OrchestratorResult<()> {
        if let Some(diff) = proposal.diff() {
            write_atomic(&self.proposal_diff_path(&proposal.proposal_id), diff.as_bytes())?;
        }
        write_json_atomic(&self.proposal_record_path(&proposal.proposal_id), proposal)?;
        Ok(())
    }

    pub fn append_proposal_audit(
        &self,
        proposal_id: &ProposalId,
        entry: &ProposalAuditEntry,
    ) -> OrchestratorResult<()> {
        let _guard = self.lock();
        append_json_line(&self.proposal_audit_path(proposal_id), entry)?;
        Ok(())
    }

    pub fn read_proposal_audit(
        &self,
        proposal_id: &ProposalId,
    ) -> OrchestratorResult<Vec<ProposalAuditEntry>> {
        let path = self.proposal_audit_path(proposal_id);
        if !path.exists() {
            if self.proposal_record_path(proposal_id).exists() {
                return Ok(Vec::new());
            }
            return Err(OrchestratorError::not_found(
                RecordKind::Proposal,
                proposal_id.as_str(),
            ));
        }
        Ok(read_json_lines(&path)?)
    }

    // ---- runs ----

    /// Append an entry to the job's run record.
    pub fn record_run(&self, entry: &RunEntry) -> OrchestratorResult<()> {
        let _guard = self.lock();
        append_json_line(&self.run_path(entry.job_id()), entry)?;
        Ok(())
    }

    pub fn get_run(&self, job_id: &JobId) -> OrchestratorResult<Vec<RunEntry>> {
        let path = self.run_path(job_id);
        if !path.exists() {
            return Err(OrchestratorError::not_found(RecordKind::Run, job_id.as_str()));
        }
        Ok(read_json_lines(&path)?)
    }
}
