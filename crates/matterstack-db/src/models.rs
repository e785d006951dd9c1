use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether the run can still make progress (eligible for scheduling).
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }

    /// Whether the run is in a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(StatusParseError("run", other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    WaitingExternal,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    /// Whether the task is finished (successfully or not).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::WaitingExternal => "WAITING_EXTERNAL",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "WAITING_EXTERNAL" => Ok(Self::WaitingExternal),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "SKIPPED" => Ok(Self::Skipped),
            other => Err(StatusParseError("task", other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a task attempt.
///
/// `FailedInit` marks an attempt that never reached its backend: a dispatch
/// error before submission, or an orphan stuck in `Created` past the
/// configured timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Created,
    Submitted,
    Running,
    WaitingExternal,
    Completed,
    Failed,
    FailedInit,
    Cancelled,
}

impl AttemptStatus {
    /// An active attempt occupies its task: at most one may exist per task.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Created | Self::Submitted | Self::Running | Self::WaitingExternal
        )
    }

    /// Terminal attempts are immutable; any further update is refused.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::FailedInit | Self::Cancelled
        )
    }

    /// Whether the attempt occupies a concurrency slot (work is in flight
    /// on a backend). `Created` does not: nothing has been submitted yet.
    pub fn occupies_slot(self) -> bool {
        matches!(self, Self::Submitted | Self::Running | Self::WaitingExternal)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::WaitingExternal => "WAITING_EXTERNAL",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::FailedInit => "FAILED_INIT",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

impl FromStr for AttemptStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "SUBMITTED" => Ok(Self::Submitted),
            "RUNNING" => Ok(Self::Running),
            "WAITING_EXTERNAL" => Ok(Self::WaitingExternal),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "FAILED_INIT" => Ok(Self::FailedInit),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(StatusParseError("attempt", other.to_owned())),
        }
    }
}

/// Map an attempt status onto the task status the step loop heals to.
pub fn task_status_from_attempt(status: AttemptStatus) -> TaskStatus {
    match status {
        AttemptStatus::Created => TaskStatus::Pending,
        AttemptStatus::Submitted => TaskStatus::WaitingExternal,
        AttemptStatus::Running => TaskStatus::Running,
        AttemptStatus::WaitingExternal => TaskStatus::WaitingExternal,
        AttemptStatus::Completed => TaskStatus::Completed,
        AttemptStatus::Failed => TaskStatus::Failed,
        AttemptStatus::FailedInit => TaskStatus::Failed,
        AttemptStatus::Cancelled => TaskStatus::Cancelled,
    }
}

/// Error returned when parsing an invalid status string.
#[derive(Debug, Clone)]
pub struct StatusParseError(pub &'static str, pub String);

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} status: {:?}", self.0, self.1)
    }
}

impl std::error::Error for StatusParseError {}

// ---------------------------------------------------------------------------
// Operator data
// ---------------------------------------------------------------------------

/// Semi-structured per-attempt payload written by operators.
///
/// Known fields are typed; anything else an operator records lands in the
/// flattened `extra` bag and round-trips untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorData {
    /// Digest of the attempt's config snapshot (byte-exact sha256).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    /// Backend-side working directory, when the backend has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_workdir: Option<String>,
    /// Output files collected after a terminal poll: name -> path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_files: Option<BTreeMap<String, String>>,
    /// Structured output collected after a terminal poll.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_data: Option<BTreeMap<String, serde_json::Value>>,
    /// Error message recorded on dispatch failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last status reason reported by the backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A run -- the top-level unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Run {
    pub run_id: String,
    pub workspace_slug: String,
    pub root_path: String,
    pub status: RunStatus,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One dispatch attempt for a task. Append-only: attempts are never deleted
/// or overwritten, and terminal rows are never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskAttempt {
    pub attempt_id: String,
    pub run_id: String,
    pub task_id: String,
    /// 1-based, strictly increasing per task, no gaps.
    pub attempt_index: i64,
    /// Legacy routing string (e.g. "HPC"); prefer `operator_key`.
    pub operator_type: Option<String>,
    /// Canonical `kind.name` routing key.
    pub operator_key: Option<String>,
    /// Backend-assigned job identifier; null until submitted.
    pub external_id: Option<String>,
    pub status: AttemptStatus,
    pub status_reason: Option<String>,
    pub operator_data: sqlx::types::Json<OperatorData>,
    /// Evidence directory relative to the run root.
    pub relative_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deprecated per-task singleton predating attempts. Read for backward
/// compatibility; new runs never create these.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LegacyExternalRun {
    pub task_id: String,
    pub run_id: String,
    pub operator_type: Option<String>,
    pub external_id: Option<String>,
    pub status: AttemptStatus,
    pub operator_data: sqlx::types::Json<OperatorData>,
    pub relative_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
