//! Job lifecycle model.
//!
//! Status transitions are monotone: `queued -> running -> {succeeded | failed |
//! canceled}`. Once a terminal state is recorded, [`JobState::transition`]
//! refuses every further change, so a terminal snapshot is stable no matter how
//! many times or from which thread it is read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ids::JobId;

/// Flat status label used by pollers and audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled => 2,
        }
    }
}

/// Why a job ended up `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Process exited with a non-zero status (or was killed by a signal).
    Exit,
    /// Runner killed the process after the configured wall-clock limit.
    TimedOut,
    /// Waiting on the child failed; the exit status is unknown.
    WaitError,
}

/// Lifecycle state with payload present only where it applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running {
        started_at: DateTime<Utc>,
    },
    Succeeded {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        returncode: i32,
    },
    Failed {
        started_at: Option<DateTime<Utc>>,
        completed_at: DateTime<Utc>,
        returncode: Option<i32>,
        reason: FailureReason,
    },
    Canceled {
        started_at: Option<DateTime<Utc>>,
        completed_at: DateTime<Utc>,
        returncode: Option<i32>,
    },
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Queued => JobStatus::Queued,
            JobState::Running { .. } => JobStatus::Running,
            JobState::Succeeded { .. } => JobStatus::Succeeded,
            JobState::Failed { .. } => JobStatus::Failed,
            JobState::Canceled { .. } => JobStatus::Canceled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobState::Queued => None,
            JobState::Running { started_at } | JobState::Succeeded { started_at, .. } => {
                Some(*started_at)
            }
            JobState::Failed { started_at, .. } | JobState::Canceled { started_at, .. } => {
                *started_at
            }
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobState::Queued | JobState::Running { .. } => None,
            JobState::Succeeded { completed_at, .. }
            | JobState::Failed { completed_at, .. }
            | JobState::Canceled { completed_at, .. } => Some(*completed_at),
        }
    }

    pub fn returncode(&self) -> Option<i32> {
        match self {
            JobState::Queued | JobState::Running { .. } => None,
            JobState::Succeeded { returncode, .. } => Some(*returncode),
            JobState::Failed { returncode, .. } | JobState::Canceled { returncode, .. } => {
                *returncode
            }
        }
    }

    /// Move to `next` if the move is forward; returns whether the state changed.
    ///
    /// Backward moves, sideways moves between terminal states, and any move out
    /// of a terminal state are ignored.
    pub fn transition(&mut self, next: JobState) -> bool {
        let (from, to) = (self.status(), next.status());
        if from.is_terminal() || to.rank() <= from.rank() {
            return false;
        }
        *self = next;
        true
    }
}

/// Point-in-time view of a job, as returned to pollers and completion subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(flatten)]
    pub state: JobState,
    pub command: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Agent task id discovered in the structured event stream, if any.
    pub task_id: Option<String>,
    /// Latest structured progress message (last JSON object seen on stdout).
    pub last_message: Option<Value>,
    pub stdout_tail: Vec<String>,
    pub stderr_tail: Vec<String>,
    pub events_tail: Vec<Value>,
}

impl Job {
    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn returncode(&self) -> Option<i32> {
        self.state.returncode()
    }
}

/// Find the first task id in an agent event (`task_id`, `taskId` or `taskID`, at any depth).
pub fn extract_task_id(event: &Value) -> Option<String> {
    match event {
        Value::Object(map) => {
            for key in ["task_id", "taskId", "taskID"] {
                if let Some(Value::String(s)) = map.get(key)
                    && !s.trim().is_empty()
                {
                    return Some(s.trim().to_string());
                }
            }
            map.values().find_map(extract_task_id)
        }
        Value::Array(items) => items.iter().find_map(extract_task_id),
        _ => None,
    }
}
