//! Dispatch queue: admission and visibility of job instances.
//!
//! Leasing is the only coordination primitive between workers. A lease hides a
//! job from every other leaser until it is acked, nacked, deferred, or its
//! visibility timeout elapses (stall recovery), which gives at-least-once
//! delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::schedule::CronSchedule;
use crate::tasks::model::validate_priority;

pub mod memory;
pub mod pg;

pub use memory::InMemoryQueue;
pub use pg::PgDispatchQueue;

/// Stable identifier tying a recurring schedule to its task.
pub fn schedule_key(task_id: Uuid) -> String {
    format!("recurring:{task_id}")
}

/// One queue-resident instance of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub payload: Value,
    pub priority: i32,
    pub attempts_allowed: i32,
    /// Attempts consumed so far: nacks plus reclaimed stalls.
    pub attempts_made: i32,
    pub schedule_key: Option<String>,
    pub visible_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub task_id: Uuid,
    pub payload: Value,
    pub attempts_allowed: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct EnqueueOptions {
    /// Not visible before `now + delay`; negative delays are rejected.
    pub delay: chrono::Duration,
    pub priority: i32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay: chrono::Duration::zero(),
            priority: 0,
        }
    }
}

impl EnqueueOptions {
    pub fn validate(&self) -> Result<()> {
        if self.delay < chrono::Duration::zero() {
            return Err(Error::InvalidSchedule(format!(
                "delay must be >= 0, got {}ms",
                self.delay.num_milliseconds()
            )));
        }
        validate_priority(self.priority)
    }
}

/// A recurring registration: re-armed at the next fire time on every ack.
#[derive(Debug, Clone)]
pub struct RecurringSpec {
    pub task_id: Uuid,
    pub schedule: CronSchedule,
    pub payload: Value,
    pub priority: i32,
    pub attempts_allowed: i32,
}

/// Proof of an exclusive visibility grant. Only the holder may ack/nack/defer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: Uuid,
    pub lease_id: Uuid,
    pub worker_id: String,
}

#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: Job,
    pub lease: Lease,
    pub leased_until: DateTime<Utc>,
}

impl LeasedJob {
    /// 1-based number of the attempt this lease is for.
    pub fn attempt(&self) -> i32 {
        self.job.attempts_made + 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Removed,
    /// Recurring job: a fresh instance was armed for the next fire time.
    Rearmed {
        next_job_id: Uuid,
        next_run_at: DateTime<Utc>,
    },
    /// Recurring job: another pending instance (armed by a re-registration
    /// while this one ran) already covers the next fire.
    AlreadyArmed {
        pending_job_id: Uuid,
        next_run_at: DateTime<Utc>,
    },
    /// The lease expired and was reclaimed; nothing was changed.
    LeaseLost,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: i64,
    pub delayed: i64,
    pub leased: i64,
    pub schedules: i64,
    pub paused: bool,
}

#[async_trait]
pub trait DispatchQueue: Send + Sync {
    async fn enqueue(&self, job: NewJob, opts: EnqueueOptions) -> Result<Job>;

    /// Idempotent per task: replaces any prior schedule and its pending
    /// instance, so a task has at most one outstanding scheduled instance.
    async fn enqueue_recurring(&self, spec: RecurringSpec) -> Result<Job>;

    /// Drops the recurring registration and its pending instance.
    async fn remove_recurring(&self, task_id: Uuid) -> Result<bool>;

    /// Atomically claims the highest-priority ready job (FIFO within a
    /// priority band) for `visibility`. `None` when nothing is ready or the
    /// queue is paused.
    async fn lease(&self, worker_id: &str, visibility: Duration) -> Result<Option<LeasedJob>>;

    async fn ack(&self, lease: &Lease) -> Result<AckOutcome>;

    /// Visible again after `delay`; consumes an attempt. Returns false when the
    /// lease was lost.
    async fn nack(&self, lease: &Lease, delay: Duration) -> Result<bool>;

    /// Like `nack` but without consuming an attempt (throttling).
    async fn defer(&self, lease: &Lease, delay: Duration) -> Result<bool>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    async fn is_paused(&self) -> Result<bool>;

    /// Returns jobs whose lease expired to the ready set. Returns how many.
    async fn reap_expired_leases(&self) -> Result<u64>;

    async fn depth(&self) -> Result<QueueDepth>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>>;

    async fn jobs_for_task(&self, task_id: Uuid) -> Result<Vec<Job>>;
}

pub(crate) fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
