use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::dead_letter::{DeadLetterJob, DeadLetterStore};
use crate::error::{ExecutionError, Result};
use crate::ledger::{ExecutionLedger, ExecutionStatus, JobExecution};
use crate::queue::{DispatchQueue, Job};

#[derive(Debug, Serialize)]
pub struct JobTimeline {
    pub job_id: Uuid,
    pub task_id: Uuid,
    /// Externally observable status, derived from ledger rows, queue residency
    /// and dead-letter state.
    pub status: ExecutionStatus,

    pub queued: Option<QueueState>,
    pub last_worker_id: Option<String>,
    pub last_error: Option<LastError>,
    pub dead_letter: Option<DeadLetterJob>,

    pub attempts: Vec<TimelineAttempt>,

    // attempts, retries and the dead-letter entry in time order
    pub story: Vec<TimelineEvent>,
}

#[derive(Debug, Serialize)]
pub struct QueueState {
    pub visible_at: DateTime<Utc>,
    pub attempts_made: i32,
    pub attempts_allowed: i32,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct TimelineAttempt {
    pub execution_id: Uuid,
    pub attempt: i32,
    pub status: ExecutionStatus,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_code: Option<&'static str>,
    pub error_message: Option<String>,
    pub suggested_action: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct LastError {
    pub error_code: &'static str,
    pub error_message: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind")]
pub enum TimelineEvent {
    Attempt {
        at: DateTime<Utc>,
        execution_id: Uuid,
        attempt: i32,
        status: ExecutionStatus,
        worker_id: String,
        error_code: Option<&'static str>,
    },
    RetryScheduled {
        at: DateTime<Utc>,
        execution_id: Uuid,
        attempt_number: i32,
        error_code: &'static str,
    },
    DeadLettered {
        at: DateTime<Utc>,
        dead_letter_id: Uuid,
        attempts: i32,
        error_code: &'static str,
    },
}

impl TimelineEvent {
    fn at(&self) -> DateTime<Utc> {
        match self {
            TimelineEvent::Attempt { at, .. }
            | TimelineEvent::RetryScheduled { at, .. }
            | TimelineEvent::DeadLettered { at, .. } => *at,
        }
    }
}

/// Observable status of a job.
///
/// Ledger rows only hold `PROCESSING`/`COMPLETED`/`FAILED`; `PENDING`, `RETRY`
/// and `DEAD_LETTER` come from where the job currently lives.
pub fn observed_status(
    executions: &[JobExecution],
    queued: Option<&Job>,
    dead_lettered: bool,
) -> Option<ExecutionStatus> {
    if dead_lettered {
        return Some(ExecutionStatus::DeadLetter);
    }
    match executions.last() {
        None => queued.map(|_| ExecutionStatus::Pending),
        Some(last) => Some(match last.status {
            ExecutionStatus::Failed if queued.is_some() => ExecutionStatus::Retry,
            other => other,
        }),
    }
}

pub async fn build_timeline(
    queue: &dyn DispatchQueue,
    ledger: &dyn ExecutionLedger,
    dead_letters: &dyn DeadLetterStore,
    job_id: Uuid,
) -> Result<Option<JobTimeline>> {
    let executions = ledger.executions_for_job(job_id).await?;
    let queued = queue.get_job(job_id).await?;
    let dead_letter = dead_letters.get_by_job(job_id).await?;

    let Some(status) = observed_status(&executions, queued.as_ref(), dead_letter.is_some()) else {
        return Ok(None);
    };

    let task_id = executions
        .first()
        .map(|e| e.task_id)
        .or_else(|| queued.as_ref().map(|j| j.task_id))
        .or_else(|| dead_letter.as_ref().map(|d| d.task_id))
        .unwrap_or_default();

    let mut story = Vec::new();
    for exec in &executions {
        story.push(TimelineEvent::Attempt {
            at: exec.started_at,
            execution_id: exec.id,
            attempt: exec.attempts,
            status: exec.status,
            worker_id: exec.worker_id.clone(),
            error_code: exec.error.as_ref().map(|e| e.kind.as_str()),
        });
        for retry in ledger.retries_for_execution(exec.id).await? {
            story.push(TimelineEvent::RetryScheduled {
                at: retry.attempted_at,
                execution_id: retry.execution_id,
                attempt_number: retry.attempt_number,
                error_code: retry.error.kind.as_str(),
            });
        }
    }
    if let Some(dl) = &dead_letter {
        story.push(TimelineEvent::DeadLettered {
            at: dl.created_at,
            dead_letter_id: dl.id,
            attempts: dl.attempts,
            error_code: dl.error.kind.as_str(),
        });
    }
    story.sort_by_key(|e| e.at());

    let last_worker_id = executions.last().map(|e| e.worker_id.clone());
    let last_error = executions
        .iter()
        .rev()
        .find_map(|e| e.error.as_ref())
        .map(|e: &ExecutionError| LastError {
            error_code: e.kind.as_str(),
            error_message: e.message.clone(),
        });

    let attempts = executions
        .into_iter()
        .map(|e| TimelineAttempt {
            execution_id: e.id,
            attempt: e.attempts,
            status: e.status,
            worker_id: e.worker_id,
            started_at: e.started_at,
            completed_at: e.completed_at,
            duration_ms: e.duration_ms,
            error_code: e.error.as_ref().map(|x| x.kind.as_str()),
            suggested_action: e.error.as_ref().map(|x| x.kind.suggested_action()),
            error_message: e.error.map(|x| x.message),
        })
        .collect();

    Ok(Some(JobTimeline {
        job_id,
        task_id,
        status,
        queued: queued.map(|j| QueueState {
            visible_at: j.visible_at,
            attempts_made: j.attempts_made,
            attempts_allowed: j.attempts_allowed,
            leased_by: j.leased_by,
            lease_expires_at: j.lease_expires_at,
        }),
        last_worker_id,
        last_error,
        dead_letter,
        attempts,
        story,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn exec(status: ExecutionStatus) -> JobExecution {
        let mut e = JobExecution::new(Uuid::new_v4(), Uuid::new_v4(), 1, "w1");
        if status != ExecutionStatus::Processing {
            e.finish(status, Utc::now());
        }
        if status == ExecutionStatus::Failed {
            e.error = Some(ExecutionError::new(ErrorKind::Handler, "boom"));
        }
        e
    }

    fn queued_job() -> Job {
        Job {
            job_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            payload: serde_json::json!({}),
            priority: 0,
            attempts_allowed: 3,
            attempts_made: 1,
            schedule_key: None,
            visible_at: Utc::now(),
            enqueued_at: Utc::now(),
            leased_by: None,
            lease_expires_at: None,
        }
    }

    #[test]
    fn derived_statuses() {
        let job = queued_job();
        assert_eq!(observed_status(&[], None, false), None);
        assert_eq!(
            observed_status(&[], Some(&job), false),
            Some(ExecutionStatus::Pending)
        );
        assert_eq!(
            observed_status(&[exec(ExecutionStatus::Failed)], Some(&job), false),
            Some(ExecutionStatus::Retry)
        );
        assert_eq!(
            observed_status(&[exec(ExecutionStatus::Failed)], None, false),
            Some(ExecutionStatus::Failed)
        );
        assert_eq!(
            observed_status(&[exec(ExecutionStatus::Failed)], None, true),
            Some(ExecutionStatus::DeadLetter)
        );
        assert_eq!(
            observed_status(&[exec(ExecutionStatus::Processing)], Some(&job), false),
            Some(ExecutionStatus::Processing)
        );
        assert_eq!(
            observed_status(&[exec(ExecutionStatus::Completed)], None, false),
            Some(ExecutionStatus::Completed)
        );
    }
}
