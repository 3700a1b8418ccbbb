//! Error taxonomy for the orchestrator's public operations.
//!
//! Lookup and precondition failures are synchronous errors returned at the
//! API boundary. Process failures are never errors here: they are encoded in
//! [`crate::core::job::JobState`] so polling stays uniform. Validation
//! violations are data on the proposal, not errors.

use serde::{Deserialize, Serialize};

/// Result alias for public orchestrator operations.
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// What kind of record a lookup or conflict refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Job,
    Insight,
    Proposal,
    Run,
    Session,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Job => "job",
            RecordKind::Insight => "insight",
            RecordKind::Proposal => "proposal",
            RecordKind::Run => "run",
            RecordKind::Session => "session",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    PreconditionFailed,
    Conflict,
    InvalidTransition,
    SpawnFailed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::PreconditionFailed => "precondition_failed",
            ErrorCode::Conflict => "conflict",
            ErrorCode::InvalidTransition => "invalid_transition",
            ErrorCode::SpawnFailed => "spawn_failed",
            ErrorCode::Internal => "internal",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The referenced job, artifact, proposal or run does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },

    /// A workflow precondition is unmet; no job was started and nothing was written.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// An id collided with an existing record holding different content.
    #[error("{kind} conflict: {id} already exists with different content")]
    Conflict { kind: RecordKind, id: String },

    /// A compare-and-set status transition lost (the record was not in the expected state).
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    /// The external process could not be started.
    #[error("failed to spawn job: {0}")]
    Spawn(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn not_found(kind: RecordKind, id: impl Into<String>) -> Self {
        OrchestratorError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        OrchestratorError::Precondition(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::NotFound { .. } => ErrorCode::NotFound,
            OrchestratorError::Precondition(_) => ErrorCode::PreconditionFailed,
            OrchestratorError::Conflict { .. } => ErrorCode::Conflict,
            OrchestratorError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            OrchestratorError::Spawn(_) => ErrorCode::SpawnFailed,
            OrchestratorError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::NotFound { .. })
    }
}
