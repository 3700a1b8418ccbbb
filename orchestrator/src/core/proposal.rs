//! Proposal record and its status machine (`missing -> ready -> applied`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{ArtifactId, JobId, ProposalId, SessionId};
use crate::error::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Missing,
    Ready,
    Applied,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalStatus::Missing => "missing",
            ProposalStatus::Ready => "ready",
            ProposalStatus::Applied => "applied",
        }
    }
}

/// Generated change plus the validation snapshot taken when it was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalContent {
    pub diff: String,
    pub summary: Option<String>,
    /// Derived from `diff`, never taken from the agent's own claim.
    pub files_touched: Vec<String>,
    pub validation_errors: Vec<String>,
    #[serde(default)]
    pub safety_notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProposalState {
    Missing,
    Ready(ProposalContent),
    Applied {
        #[serde(flatten)]
        content: ProposalContent,
        applied_at: DateTime<Utc>,
        files_changed: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: ProposalId,
    pub session_id: SessionId,
    pub insight_artifact_id: ArtifactId,
    pub job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: ProposalState,
}

impl Proposal {
    pub fn new(
        proposal_id: ProposalId,
        session_id: SessionId,
        insight_artifact_id: ArtifactId,
        job_id: Option<JobId>,
    ) -> Self {
        Self {
            proposal_id,
            session_id,
            insight_artifact_id,
            job_id,
            created_at: Utc::now(),
            state: ProposalState::Missing,
        }
    }

    pub fn status(&self) -> ProposalStatus {
        match self.state {
            ProposalState::Missing => ProposalStatus::Missing,
            ProposalState::Ready(_) => ProposalStatus::Ready,
            ProposalState::Applied { .. } => ProposalStatus::Applied,
        }
    }

    pub fn content(&self) -> Option<&ProposalContent> {
        match &self.state {
            ProposalState::Missing => None,
            ProposalState::Ready(content) | ProposalState::Applied { content, .. } => {
                Some(content)
            }
        }
    }

    pub fn diff(&self) -> Option<&str> {
        self.content().map(|c| c.diff.as_str())
    }

    pub fn validation_errors(&self) -> &[String] {
        self.content()
            .map(|c| c.validation_errors.as_slice())
            .unwrap_or_default()
    }

    /// `missing -> ready`. Fails if another completion already won.
    pub fn mark_ready(&mut self, content: ProposalContent) -> OrchestratorResult<()> {
        self.expect_status(ProposalStatus::Missing, ProposalStatus::Ready)?;
        self.state = ProposalState::Ready(content);
        Ok(())
    }

    /// `ready -> applied`.
    pub fn mark_applied(
        &mut self,
        applied_at: DateTime<Utc>,
        files_changed: Vec<String>,
    ) -> OrchestratorResult<()> {
        self.expect_status(ProposalStatus::Ready, ProposalStatus::Applied)?;
        if let ProposalState::Ready(content) = &self.state {
            self.state = ProposalState::Applied {
                content: content.clone(),
                applied_at,
                files_changed,
            };
        }
        Ok(())
    }

    fn expect_status(&self, from: ProposalStatus, to: ProposalStatus) -> OrchestratorResult<()> {
        let current = self.status();
        if current != from {
            return Err(OrchestratorError::InvalidTransition {
                id: self.proposal_id.to_string(),
                from: current.as_str(),
                to: to.as_str(),
            });
        }
        Ok(())
    }
}
