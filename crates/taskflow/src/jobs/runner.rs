use chrono::Utc;
use rand::{rngs::StdRng, SeedableRng};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dead_letter::{DeadLetterStore, NewDeadLetter};
use crate::error::{ErrorKind, ExecutionError, Result};
use crate::events::{EventSink, PipelineEvent};
use crate::jobs::handler::{HandlerContext, HandlerRegistry};
use crate::jobs::rate_limit::RateLimiter;
use crate::jobs::retry::{decide, DeadLetterReason, RetryConfig, RetryDecision};
use crate::ledger::{ExecutionLedger, ExecutionStatus, JobExecution};
use crate::queue::{AckOutcome, DispatchQueue, LeasedJob};
use crate::tasks::{Task, TaskStore};

/// What happened to one leased job.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Task inactive or deleted: acked without an execution row.
    Skipped { reason: String },
    /// Over the task's rate limit: deferred without consuming an attempt.
    Throttled,
    Completed { execution_id: Uuid },
    Retrying { execution_id: Uuid, delay: Duration },
    DeadLettered {
        execution_id: Uuid,
        reason: DeadLetterReason,
    },
    /// The lease expired under us and another worker took over; nothing
    /// further was written.
    LeaseLost,
}

/// Executes the per-attempt contract for leased jobs: validate the task, open
/// a ledger row, race the handler against its timeout, record the single
/// authoritative outcome, then ack, nack or dead-letter.
#[derive(Clone)]
pub struct JobRunner {
    tasks: Arc<dyn TaskStore>,
    queue: Arc<dyn DispatchQueue>,
    ledger: Arc<dyn ExecutionLedger>,
    dead_letters: Arc<dyn DeadLetterStore>,
    handlers: Arc<HandlerRegistry>,
    events: Arc<dyn EventSink>,
    limiter: Arc<RateLimiter>,
    retry_cfg: RetryConfig,
    throttle_delay: Duration,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        queue: Arc<dyn DispatchQueue>,
        ledger: Arc<dyn ExecutionLedger>,
        dead_letters: Arc<dyn DeadLetterStore>,
        handlers: Arc<HandlerRegistry>,
        events: Arc<dyn EventSink>,
        limiter: Arc<RateLimiter>,
        retry_cfg: RetryConfig,
        throttle_delay: Duration,
    ) -> Self {
        Self {
            tasks,
            queue,
            ledger,
            dead_letters,
            handlers,
            events,
            limiter,
            retry_cfg,
            throttle_delay,
        }
    }

    pub fn queue(&self) -> &Arc<dyn DispatchQueue> {
        &self.queue
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub async fn process(&self, leased: LeasedJob) -> Result<RunOutcome> {
        let job = &leased.job;

        let task = match self.tasks.get_task(job.task_id).await? {
            Some(task) => task,
            None => return self.dead_letter_dangling(&leased).await,
        };

        if !task.is_active() {
            let reason = if task.deleted_at.is_some() {
                "deleted".to_string()
            } else {
                task.status.as_str().to_lowercase()
            };
            return self.skip(&leased, &task, reason).await;
        }

        if let Some(limit) = task.rate_limit {
            if !self.limiter.try_acquire(task.id, limit.max(1) as u32) {
                tracing::debug!(
                    task_id = %task.id,
                    job_id = %job.job_id,
                    limit,
                    delay_ms = self.throttle_delay.as_millis() as u64,
                    "rate limited; deferring"
                );
                return Ok(if self.queue.defer(&leased.lease, self.throttle_delay).await? {
                    RunOutcome::Throttled
                } else {
                    RunOutcome::LeaseLost
                });
            }
        }

        let exec = self.start(&leased).await?;
        let outcome = self.invoke(&task, &leased, &exec).await;

        match outcome {
            Ok(result) => self.on_success(&task, &leased, &exec, result).await,
            Err(err) => self.on_failure(&task, &leased, &exec, err).await,
        }
    }

    async fn start(&self, leased: &LeasedJob) -> Result<JobExecution> {
        let job = &leased.job;
        let exec = self
            .ledger
            .start_execution(
                job.task_id,
                job.job_id,
                leased.attempt(),
                &leased.lease.worker_id,
            )
            .await?;

        self.events.emit(&PipelineEvent::AttemptStarted {
            task_id: job.task_id,
            job_id: job.job_id,
            execution_id: exec.id,
            attempt: exec.attempts,
            worker_id: exec.worker_id.clone(),
            at: exec.started_at,
        });

        Ok(exec)
    }

    /// Runs the handler on its own task and races it against the attempt
    /// timeout. On timeout the handler is signalled and detached; whatever it
    /// returns later is dropped.
    async fn invoke(
        &self,
        task: &Task,
        leased: &LeasedJob,
        exec: &JobExecution,
    ) -> std::result::Result<Value, ExecutionError> {
        let Some(handler) = self.handlers.handler_for(&task.name) else {
            return Err(ExecutionError::new(
                ErrorKind::UnknownHandler,
                format!("no handler registered for task {}", task.name),
            ));
        };

        let cancel = CancellationToken::new();
        let ctx = HandlerContext {
            worker_id: leased.lease.worker_id.clone(),
            job_id: leased.job.job_id,
            attempt: exec.attempts,
            cancel: cancel.clone(),
        };
        let owned_task = task.clone();
        let payload = leased.job.payload.clone();

        let mut handle =
            tokio::spawn(async move { handler.execute(&owned_task, payload, ctx).await });

        match tokio::time::timeout(task.timeout(), &mut handle).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(join_err)) if join_err.is_panic() => Err(ExecutionError::new(
                ErrorKind::Panic,
                "task handler panicked",
            )
            .with_detail(panic_message(join_err.into_panic()))),
            Ok(Err(join_err)) => Err(ExecutionError::new(
                ErrorKind::Handler,
                format!("task handler aborted: {join_err}"),
            )),
            Err(_) => {
                cancel.cancel();
                tracing::warn!(
                    task_id = %task.id,
                    job_id = %leased.job.job_id,
                    attempt = exec.attempts,
                    timeout_ms = task.timeout_ms,
                    "attempt timed out; handler detached"
                );
                Err(ExecutionError::timeout(task.timeout_ms.max(0) as u64))
            }
        }
    }

    async fn on_success(
        &self,
        task: &Task,
        leased: &LeasedJob,
        exec: &JobExecution,
        result: Value,
    ) -> Result<RunOutcome> {
        if !self.ledger.complete_execution(exec.id, result).await? {
            tracing::warn!(execution_id = %exec.id, job_id = %leased.job.job_id, "execution already closed; result discarded");
            return Ok(RunOutcome::LeaseLost);
        }
        self.emit_finished(leased, exec, ExecutionStatus::Completed, None);

        match self.queue.ack(&leased.lease).await? {
            AckOutcome::LeaseLost => {
                tracing::warn!(job_id = %leased.job.job_id, "lease lost before ack");
                return Ok(RunOutcome::LeaseLost);
            }
            outcome => self.record_run_times(task, &outcome, true).await?,
        }

        Ok(RunOutcome::Completed {
            execution_id: exec.id,
        })
    }

    async fn on_failure(
        &self,
        task: &Task,
        leased: &LeasedJob,
        exec: &JobExecution,
        err: ExecutionError,
    ) -> Result<RunOutcome> {
        if !self.ledger.fail_execution(exec.id, &err).await? {
            tracing::warn!(execution_id = %exec.id, job_id = %leased.job.job_id, "execution already closed; failure discarded");
            return Ok(RunOutcome::LeaseLost);
        }
        self.emit_finished(leased, exec, ExecutionStatus::Failed, Some(err.kind));

        let job = &leased.job;
        let mut rng = StdRng::from_entropy();
        match decide(
            &err,
            exec.attempts,
            job.attempts_allowed,
            &self.retry_cfg,
            &mut rng,
        ) {
            RetryDecision::Retry { delay } => {
                self.ledger
                    .record_retry(exec.id, exec.attempts, &err)
                    .await?;
                if !self.queue.nack(&leased.lease, delay).await? {
                    tracing::warn!(job_id = %job.job_id, "lease lost before nack");
                    return Ok(RunOutcome::LeaseLost);
                }

                self.events.emit(&PipelineEvent::RetryScheduled {
                    task_id: job.task_id,
                    job_id: job.job_id,
                    attempt: exec.attempts,
                    delay_ms: delay.as_millis() as u64,
                    at: Utc::now(),
                });

                Ok(RunOutcome::Retrying {
                    execution_id: exec.id,
                    delay,
                })
            }
            RetryDecision::DeadLetter { reason } => {
                self.dead_letter(leased, exec.attempts, err, reason).await?;
                match self.queue.ack(&leased.lease).await? {
                    AckOutcome::LeaseLost => {
                        tracing::warn!(job_id = %job.job_id, "lease lost before ack");
                    }
                    outcome => self.record_run_times(task, &outcome, true).await?,
                }
                Ok(RunOutcome::DeadLettered {
                    execution_id: exec.id,
                    reason,
                })
            }
        }
    }

    /// The job's task row is gone: a permanent failure on first sight.
    async fn dead_letter_dangling(&self, leased: &LeasedJob) -> Result<RunOutcome> {
        let exec = self.start(leased).await?;
        let err = ExecutionError::task_not_found(leased.job.task_id);

        if !self.ledger.fail_execution(exec.id, &err).await? {
            return Ok(RunOutcome::LeaseLost);
        }
        self.emit_finished(leased, &exec, ExecutionStatus::Failed, Some(err.kind));

        self.dead_letter(leased, exec.attempts, err, DeadLetterReason::NonRetryable)
            .await?;
        if let AckOutcome::LeaseLost = self.queue.ack(&leased.lease).await? {
            tracing::warn!(job_id = %leased.job.job_id, "lease lost before ack");
        }

        Ok(RunOutcome::DeadLettered {
            execution_id: exec.id,
            reason: DeadLetterReason::NonRetryable,
        })
    }

    async fn dead_letter(
        &self,
        leased: &LeasedJob,
        attempts: i32,
        err: ExecutionError,
        reason: DeadLetterReason,
    ) -> Result<()> {
        let job = &leased.job;
        let kind = err.kind;
        let inserted = self
            .dead_letters
            .insert(NewDeadLetter {
                task_id: job.task_id,
                job_id: job.job_id,
                payload: job.payload.clone(),
                error: err,
                attempts,
            })
            .await?;

        match inserted {
            Some(dl) => {
                tracing::warn!(
                    task_id = %job.task_id,
                    job_id = %job.job_id,
                    attempts,
                    reason = reason.as_str(),
                    error_kind = kind.as_str(),
                    "routing job to dead letter"
                );
                self.events.emit(&PipelineEvent::DeadLettered {
                    task_id: job.task_id,
                    job_id: job.job_id,
                    dead_letter_id: dl.id,
                    attempts,
                    error_kind: kind,
                    at: dl.created_at,
                });
            }
            None => {
                tracing::debug!(job_id = %job.job_id, "job already dead-lettered");
            }
        }
        Ok(())
    }

    async fn skip(&self, leased: &LeasedJob, task: &Task, reason: String) -> Result<RunOutcome> {
        let outcome = self.queue.ack(&leased.lease).await?;
        if outcome == AckOutcome::LeaseLost {
            return Ok(RunOutcome::LeaseLost);
        }
        self.record_run_times(task, &outcome, false).await?;

        self.events.emit(&PipelineEvent::JobSkipped {
            task_id: task.id,
            job_id: leased.job.job_id,
            reason: reason.clone(),
            at: Utc::now(),
        });

        Ok(RunOutcome::Skipped { reason })
    }

    /// `lastRunAt`/`nextRunAt` bookkeeping, recurring tasks only. A skipped
    /// fire did not run, so `lastRunAt` is left alone.
    async fn record_run_times(&self, task: &Task, ack: &AckOutcome, ran: bool) -> Result<()> {
        if !task.is_recurring() {
            return Ok(());
        }
        let next_run_at = match ack {
            AckOutcome::Rearmed { next_run_at, .. } | AckOutcome::AlreadyArmed { next_run_at, .. } => {
                Some(*next_run_at)
            }
            AckOutcome::Removed | AckOutcome::LeaseLost => None,
        };
        let last_run_at = ran.then(Utc::now);
        self.tasks
            .update_task_run_times(task.id, last_run_at, next_run_at)
            .await
    }

    fn emit_finished(
        &self,
        leased: &LeasedJob,
        exec: &JobExecution,
        status: ExecutionStatus,
        error_kind: Option<ErrorKind>,
    ) {
        let now = Utc::now();
        self.events.emit(&PipelineEvent::AttemptFinished {
            task_id: leased.job.task_id,
            job_id: leased.job.job_id,
            execution_id: exec.id,
            attempt: exec.attempts,
            status,
            duration_ms: (now - exec.started_at).num_milliseconds().max(0),
            error_kind,
            at: now,
        });
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
