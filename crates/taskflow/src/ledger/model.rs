use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ExecutionError;

/// Status of one attempt.
///
/// Stored rows only ever hold `Processing`, `Completed` or `Failed`; the other
/// three are derived for display by the timeline view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retry,
    DeadLetter,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Processing => "PROCESSING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Retry => "RETRY",
            ExecutionStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ExecutionStatus::Pending),
            "PROCESSING" => Some(ExecutionStatus::Processing),
            "COMPLETED" => Some(ExecutionStatus::Completed),
            "FAILED" => Some(ExecutionStatus::Failed),
            "RETRY" => Some(ExecutionStatus::Retry),
            "DEAD_LETTER" => Some(ExecutionStatus::DeadLetter),
            _ => None,
        }
    }

    /// `completed_at` is set exactly for these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt of one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobExecution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub status: ExecutionStatus,
    /// 1-based attempt number.
    pub attempts: i32,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<ExecutionError>,
}

impl JobExecution {
    pub fn new(task_id: Uuid, job_id: Uuid, attempts: i32, worker_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            job_id,
            status: ExecutionStatus::Processing,
            attempts,
            worker_id: worker_id.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            result: None,
            error: None,
        }
    }

    pub fn is_processing(&self) -> bool {
        self.status == ExecutionStatus::Processing
    }

    pub(crate) fn finish(&mut self, status: ExecutionStatus, at: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(at);
        self.duration_ms = Some((at - self.started_at).num_milliseconds().max(0));
    }
}

/// Append-only record of a failed attempt that was scheduled for retry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub attempt_number: i32,
    pub error: ExecutionError,
    pub attempted_at: DateTime<Utc>,
}
