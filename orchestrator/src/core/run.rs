//! Audit records: per-job run entries and per-proposal history.
//!
//! Both logs are append-only JSONL; these are their line types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{ArtifactId, JobId, SessionId};
use crate::core::job::JobStatus;

/// How the agent sees the conversation being analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Fresh agent session; the transcript is embedded in the prompt.
    #[default]
    Fork,
    /// Continue the original session in place.
    Resume,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Fork => "fork",
            RunMode::Resume => "resume",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fork" => Ok(RunMode::Fork),
            "resume" => Ok(RunMode::Resume),
            other => Err(anyhow!("unknown mode '{other}' (expected fork or resume)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Insights,
    Proposal,
}

/// What the workflow did with a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Output was valid and persisted.
    Stored,
    /// The process failed (non-zero exit, timeout, wait error).
    ProcessFailed,
    Canceled,
    /// The process succeeded but its output was rejected.
    SchemaViolation,
    /// Persisting the output failed.
    StoreFailed,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Stored => "stored",
            RunOutcome::ProcessFailed => "process_failed",
            RunOutcome::Canceled => "canceled",
            RunOutcome::SchemaViolation => "schema_violation",
            RunOutcome::StoreFailed => "store_failed",
        }
    }
}

/// Inputs recorded when a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInputs {
    pub session_id: SessionId,
    pub mode: RunMode,
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight_artifact_id: Option<ArtifactId>,
}

/// Ids the run will produce.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<ArtifactId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<crate::core::ids::ProposalId>,
}

/// One line of `runs/<job_id>.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEntry {
    Started {
        at: DateTime<Utc>,
        job_id: JobId,
        kind: RunKind,
        inputs: RunInputs,
        outputs: RunOutputs,
        command: Vec<String>,
        workdir: PathBuf,
    },
    Finished {
        at: DateTime<Utc>,
        job_id: JobId,
        status: JobStatus,
        returncode: Option<i32>,
        outcome: RunOutcome,
        #[serde(default)]
        errors: Vec<String>,
    },
}

impl RunEntry {
    pub fn job_id(&self) -> &JobId {
        match self {
            RunEntry::Started { job_id, .. } | RunEntry::Finished { job_id, .. } => job_id,
        }
    }
}

/// One line of `proposals/<id>/audit.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProposalAuditEntry {
    Created {
        at: DateTime<Utc>,
        job_id: JobId,
    },
    Generated {
        at: DateTime<Utc>,
        job_id: JobId,
        files_touched: Vec<String>,
        validation_errors: Vec<String>,
    },
    GenerationFailed {
        at: DateTime<Utc>,
        job_id: JobId,
        outcome: RunOutcome,
        errors: Vec<String>,
    },
    Applied {
        at: DateTime<Utc>,
        files_changed: Vec<String>,
        /// Validation result at apply time (always empty for a successful apply).
        validation_errors: Vec<String>,
    },
    ApplyRejected {
        at: DateTime<Utc>,
        errors: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_and_displays() {
        assert_eq!("fork".parse::<RunMode>().expect("fork"), RunMode::Fork);
        assert_eq!("resume".parse::<RunMode>().expect("resume"), RunMode::Resume);
        assert!("branch".parse::<RunMode>().is_err());
        assert_eq!(RunMode::Resume.to_string(), "resume");
    }

    #[test]
    fn run_entries_are_tagged() {
        let entry = RunEntry::Finished {
            at: Utc::now(),
            job_id: JobId::parse("j1").expect("id"),
            status: JobStatus::Failed,
            returncode: Some(1),
            outcome: RunOutcome::ProcessFailed,
            errors: vec!["boom".to_string()],
        };
        let value = serde_json::to_value(&entry).expect("json");
        assert_eq!(value["event"], "finished");
        assert_eq!(value["outcome"], "process_failed");
        assert_eq!(value["status"], "failed");
    }
}
