// crates/taskflow/src/error.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schedule::CronError;
use crate::tasks::TaskStatus;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced synchronously by the admission path and the stores.
///
/// Execution-time failures never travel through this type; they are captured
/// as [`ExecutionError`] rows in the ledger.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid schedule expression: {0}")]
    InvalidScheduleExpression(#[from] CronError),

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("task {task_id} is not active (status={status})")]
    TaskInactive { task_id: Uuid, status: TaskStatus },

    #[error("dead letter {0} not found")]
    DeadLetterNotFound(Uuid),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Transport-level failures the worker pool backs off on. These are
    /// infrastructure retries and never consume a task attempt.
    pub fn is_retriable_infra(&self) -> bool {
        matches!(self, Error::QueueUnavailable(_) | Error::Storage(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

/// Failure kinds captured into the ledger for a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    #[serde(rename = "HANDLER_ERROR")]
    Handler,
    Timeout,
    TaskNotFound,
    BadPayload,
    UnknownHandler,
    Panic,
    Stalled,
}

impl ErrorKind {
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::TaskNotFound | ErrorKind::BadPayload | ErrorKind::UnknownHandler => {
                ErrorClass::NonRetryable
            }
            ErrorKind::Handler | ErrorKind::Timeout | ErrorKind::Panic | ErrorKind::Stalled => {
                ErrorClass::Retryable
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Handler => "HANDLER_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::TaskNotFound => "TASK_NOT_FOUND",
            ErrorKind::BadPayload => "BAD_PAYLOAD",
            ErrorKind::UnknownHandler => "UNKNOWN_HANDLER",
            ErrorKind::Panic => "PANIC",
            ErrorKind::Stalled => "STALLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "HANDLER_ERROR" => Some(Self::Handler),
            "TIMEOUT" => Some(Self::Timeout),
            "TASK_NOT_FOUND" => Some(Self::TaskNotFound),
            "BAD_PAYLOAD" => Some(Self::BadPayload),
            "UNKNOWN_HANDLER" => Some(Self::UnknownHandler),
            "PANIC" => Some(Self::Panic),
            "STALLED" => Some(Self::Stalled),
            _ => None,
        }
    }

    pub fn suggested_action(&self) -> &'static str {
        match self {
            ErrorKind::Handler => {
                "Inspect error message + logs. Fix task logic; replay from the dead-letter store once fixed."
            }
            ErrorKind::Timeout => {
                "Increase timeoutMs OR reduce payload/work. Check downstream latency."
            }
            ErrorKind::TaskNotFound => {
                "Non-retryable. The owning task was removed; purge the dead letter or recreate the task."
            }
            ErrorKind::BadPayload => {
                "Non-retryable. Validate payload schema/fields. Fix producer and replay."
            }
            ErrorKind::UnknownHandler => {
                "Non-retryable. Register a handler for this task name on the workers."
            }
            ErrorKind::Panic => {
                "Investigate crash. Capture panic info, add safeguards, consider making the failure explicit."
            }
            ErrorKind::Stalled => {
                "Worker lost its lease (crash or overload). Check worker health and visibility timeout."
            }
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure of one attempt: message, kind and stack-like detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("task execution timed out after {timeout_ms}ms"),
        )
    }

    pub fn task_not_found(task_id: Uuid) -> Self {
        Self::new(ErrorKind::TaskNotFound, format!("task {task_id} not found"))
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.class() == ErrorClass::Retryable
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({ "kind": self.kind.as_str(), "message": self.message })
        })
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
