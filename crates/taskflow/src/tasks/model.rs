use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::schedule::CronSchedule;

pub const MIN_PRIORITY: i32 = 0;
pub const MAX_PRIORITY: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    OneTime,
    Recurring,
    Delayed,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::OneTime => "ONE_TIME",
            TaskType::Recurring => "RECURRING",
            TaskType::Delayed => "DELAYED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ONE_TIME" => Some(TaskType::OneTime),
            "RECURRING" => Some(TaskType::Recurring),
            "DELAYED" => Some(TaskType::Delayed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "ACTIVE",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(TaskStatus::Active),
            "PAUSED" => Some(TaskStatus::Paused),
            "COMPLETED" => Some(TaskStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schedulable unit of work, owned by `owner`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub owner: String,

    pub task_type: TaskType,
    pub status: TaskStatus,
    pub schedule_expression: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,

    pub priority: i32,
    pub payload: Value,
    pub max_retries: i32,
    pub timeout_ms: i64,
    pub rate_limit: Option<i32>,

    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Eligible for dispatch: `ACTIVE` and not soft-deleted.
    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active && self.deleted_at.is_none()
    }

    pub fn is_recurring(&self) -> bool {
        self.task_type == TaskType::Recurring
    }

    /// First attempt plus `max_retries` re-attempts.
    pub fn attempts_allowed(&self) -> i32 {
        self.max_retries.max(0) + 1
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1) as u64)
    }

    pub fn schedule(&self) -> Option<Result<CronSchedule>> {
        self.schedule_expression
            .as_deref()
            .map(|expr| CronSchedule::parse(expr).map_err(Error::from))
    }
}

/// Creation request for a [`Task`]; checked by [`NewTask::validate`] before it
/// reaches the store or the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub owner: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub schedule_expression: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: i64,
    #[serde(default)]
    pub rate_limit: Option<i32>,
}

fn default_max_retries() -> i32 {
    3
}

fn default_timeout_ms() -> i64 {
    30_000
}

impl NewTask {
    pub fn one_time(name: impl Into<String>, owner: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            description: None,
            owner: owner.into(),
            task_type: TaskType::OneTime,
            schedule_expression: None,
            scheduled_at: Some(Utc::now()),
            priority: 0,
            payload,
            max_retries: default_max_retries(),
            timeout_ms: default_timeout_ms(),
            rate_limit: None,
        }
    }

    pub fn delayed(
        name: impl Into<String>,
        owner: impl Into<String>,
        payload: Value,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_type: TaskType::Delayed,
            scheduled_at: Some(scheduled_at),
            ..Self::one_time(name, owner, payload)
        }
    }

    pub fn recurring(
        name: impl Into<String>,
        owner: impl Into<String>,
        payload: Value,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            task_type: TaskType::Recurring,
            schedule_expression: Some(expression.into()),
            scheduled_at: None,
            ..Self::one_time(name, owner, payload)
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn rate_limit(mut self, rate_limit: i32) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Checks field invariants and returns the parsed schedule for recurring
    /// tasks. Expressions that can never fire are rejected here too.
    pub fn validate(&self) -> Result<Option<CronSchedule>> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidSchedule("name is required".into()));
        }
        validate_priority(self.priority)?;
        if self.max_retries < 0 {
            return Err(Error::InvalidSchedule("maxRetries must be >= 0".into()));
        }
        if self.timeout_ms <= 0 {
            return Err(Error::InvalidSchedule("timeoutMs must be > 0".into()));
        }
        if matches!(self.rate_limit, Some(n) if n < 1) {
            return Err(Error::InvalidSchedule("rateLimit must be >= 1".into()));
        }

        match self.task_type {
            TaskType::Recurring => {
                if self.scheduled_at.is_some() {
                    return Err(Error::InvalidSchedule(
                        "scheduledAt is forbidden for RECURRING tasks".into(),
                    ));
                }
                let expr = self.schedule_expression.as_deref().ok_or_else(|| {
                    Error::InvalidSchedule("scheduleExpression is required for RECURRING tasks".into())
                })?;
                let schedule = CronSchedule::parse(expr)?;
                schedule.next_after(Utc::now())?;
                Ok(Some(schedule))
            }
            TaskType::OneTime | TaskType::Delayed => {
                if self.schedule_expression.is_some() {
                    return Err(Error::InvalidSchedule(format!(
                        "scheduleExpression is forbidden for {} tasks",
                        self.task_type.as_str()
                    )));
                }
                if self.scheduled_at.is_none() {
                    return Err(Error::InvalidSchedule(format!(
                        "scheduledAt is required for {} tasks",
                        self.task_type.as_str()
                    )));
                }
                Ok(None)
            }
        }
    }
}

pub fn validate_priority(priority: i32) -> Result<()> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(Error::InvalidSchedule(format!(
            "priority {priority} is outside [{MIN_PRIORITY}, {MAX_PRIORITY}]"
        )));
    }
    Ok(())
}
