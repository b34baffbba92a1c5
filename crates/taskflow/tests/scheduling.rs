mod common;

use async_trait::async_trait;
use chrono::Utc;
use common::{wait_until, Harness};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use taskflow::dead_letter::DeadLetterStore;
use taskflow::jobs::{boxed, DeadLetterReason, HandlerRegistry, RunOutcome};
use taskflow::ledger::{ExecutionLedger, ExecutionStatus};
use taskflow::queue::{
    schedule_key, AckOutcome, DispatchQueue, EnqueueOptions, InMemoryQueue, Job, Lease, LeasedJob,
    NewJob, QueueDepth, RecurringSpec,
};
use taskflow::schedule::CronSchedule;
use taskflow::tasks::{NewTask, TaskScheduler, TaskStatus, TaskStore};
use taskflow::{Error, ErrorKind, Result};
use uuid::Uuid;

fn ok_handlers(name: &str) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn(name, |_task, _payload, _ctx| boxed(async move { Ok(Value::Null) }));
    handlers
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recurring_task_fires_repeatedly_with_fresh_jobs() {
    let h = Harness::new();
    let task = h
        .scheduler
        .create_task(NewTask::recurring("tick", "tests", json!({}), "* * * * * *"))
        .await
        .unwrap();
    let first_next_run = task.next_run_at.expect("recurring task has nextRunAt");
    assert!(first_next_run > task.created_at);

    let pool = h.pool(ok_handlers("tick"), "worker-a", 2).spawn();

    let ledger = h.ledger.clone();
    let task_id = task.id;
    let fired = wait_until(Duration::from_secs(6), || {
        let ledger = ledger.clone();
        async move {
            ledger
                .executions_for_task(task_id, 100)
                .await
                .unwrap()
                .iter()
                .filter(|e| e.status == ExecutionStatus::Completed)
                .count()
                >= 3
        }
    })
    .await;
    pool.shutdown().await;
    assert!(fired, "recurring task did not fire three times");

    let mut execs = h.ledger.executions_for_task(task.id, 100).await.unwrap();
    execs.reverse();
    let job_ids: HashSet<Uuid> = execs.iter().map(|e| e.job_id).collect();
    assert_eq!(job_ids.len(), execs.len(), "every fire is a distinct job");
    for pair in execs.windows(2) {
        assert!(pair[0].started_at <= pair[1].started_at);
    }

    let task = h.tasks.get_task(task.id).await.unwrap().unwrap();
    assert!(task.last_run_at.is_some());
    let next_run = task.next_run_at.expect("still armed");
    assert!(next_run > first_next_run);

    // the schedule stays armed with exactly one pending instance
    let pending = h.queue.jobs_for_task(task.id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].schedule_key.as_deref(), Some(schedule_key(task.id).as_str()));
}

#[tokio::test]
async fn arming_a_schedule_twice_keeps_one_pending_instance() {
    let h = Harness::new();
    let task_id = Uuid::new_v4();
    let spec = RecurringSpec {
        task_id,
        schedule: CronSchedule::parse("*/5 * * * *").unwrap(),
        payload: json!({}),
        priority: 0,
        attempts_allowed: 1,
    };

    h.queue.enqueue_recurring(spec.clone()).await.unwrap();
    h.queue.enqueue_recurring(spec).await.unwrap();

    assert_eq!(h.queue.jobs_for_task(task_id).await.unwrap().len(), 1);
    assert_eq!(h.queue.depth().await.unwrap().schedules, 1);

    assert!(h.queue.remove_recurring(task_id).await.unwrap());
    assert!(h.queue.jobs_for_task(task_id).await.unwrap().is_empty());
    assert!(!h.queue.remove_recurring(task_id).await.unwrap());
}

#[tokio::test]
async fn delayed_task_is_invisible_until_due() {
    let h = Harness::new();
    let due = Utc::now() + chrono::Duration::milliseconds(300);
    h.scheduler
        .create_task(NewTask::delayed("later", "tests", json!({}), due))
        .await
        .unwrap();

    assert!(h.queue.lease("w1", Duration::from_secs(5)).await.unwrap().is_none());
    assert_eq!(h.queue.depth().await.unwrap().delayed, 1);

    tokio::time::sleep(Duration::from_millis(350)).await;
    let leased = h.queue.lease("w1", Duration::from_secs(5)).await.unwrap();
    assert!(leased.is_some());
}

#[tokio::test]
async fn invalid_definitions_are_rejected_before_queueing() {
    let h = Harness::new();

    let err = h
        .scheduler
        .create_task(NewTask::recurring("bad", "tests", json!({}), "61 * * * *"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidScheduleExpression(_)), "{err}");

    let mut missing = NewTask::recurring("bad", "tests", json!({}), "* * * * *");
    missing.schedule_expression = None;
    let err = h.scheduler.create_task(missing).await.unwrap_err();
    assert!(matches!(err, Error::InvalidSchedule(_)), "{err}");

    let err = h
        .scheduler
        .create_task(NewTask::one_time("bad", "tests", json!({})).priority(11))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSchedule(_)), "{err}");

    let err = h
        .scheduler
        .create_task(NewTask::one_time("bad", "tests", json!({})).timeout_ms(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSchedule(_)), "{err}");

    let depth = h.queue.depth().await.unwrap();
    assert_eq!(depth.ready + depth.delayed + depth.schedules, 0);
}

#[tokio::test]
async fn paused_task_is_skipped_without_an_execution() {
    let h = Harness::new();
    let runner = h.runner(ok_handlers("demo_ok"));

    let task = h
        .scheduler
        .create_task(NewTask::one_time("demo_ok", "tests", json!({})))
        .await
        .unwrap();
    let paused = h.scheduler.pause_task(task.id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);

    let outcomes = h.drive(&runner, "worker-a").await;
    assert_eq!(
        outcomes,
        vec![RunOutcome::Skipped {
            reason: "paused".into()
        }]
    );
    assert!(h.ledger.executions_for_task(task.id, 10).await.unwrap().is_empty());
    assert!(h.queue.jobs_for_task(task.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn resume_rearms_a_paused_recurring_task() {
    let h = Harness::new();
    let task = h
        .scheduler
        .create_task(NewTask::recurring("tick", "tests", json!({}), "0 0 * * *"))
        .await
        .unwrap();

    h.scheduler.pause_task(task.id).await.unwrap();
    let resumed = h.scheduler.resume_task(task.id).await.unwrap();
    assert_eq!(resumed.status, TaskStatus::Active);
    assert!(resumed.next_run_at.is_some());
    assert_eq!(h.queue.jobs_for_task(task.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn deleted_task_drops_its_schedule_and_pending_jobs_are_skipped() {
    let h = Harness::new();
    let runner = h.runner(ok_handlers("demo_ok"));

    let recurring = h
        .scheduler
        .create_task(NewTask::recurring("tick", "tests", json!({}), "0 0 * * *"))
        .await
        .unwrap();
    h.scheduler.delete_task(recurring.id).await.unwrap();
    assert!(h.queue.jobs_for_task(recurring.id).await.unwrap().is_empty());
    assert!(matches!(
        h.scheduler.get_task(recurring.id).await,
        Err(Error::TaskNotFound(_))
    ));

    let once = h
        .scheduler
        .create_task(NewTask::one_time("demo_ok", "tests", json!({})))
        .await
        .unwrap();
    h.scheduler.delete_task(once.id).await.unwrap();

    let outcomes = h.drive(&runner, "worker-a").await;
    assert_eq!(
        outcomes,
        vec![RunOutcome::Skipped {
            reason: "deleted".into()
        }]
    );
    assert!(h.ledger.all_executions().is_empty());
}

#[tokio::test]
async fn job_without_a_task_row_goes_straight_to_dead_letter() {
    let h = Harness::new();
    let runner = h.runner(ok_handlers("demo_ok"));

    let task = h
        .scheduler
        .create_task(NewTask::one_time("demo_ok", "tests", json!({ "orphan": true })).max_retries(5))
        .await
        .unwrap();
    assert!(h.tasks.hard_delete(task.id));

    let outcomes = h.drive(&runner, "worker-a").await;
    assert!(matches!(
        outcomes.as_slice(),
        [RunOutcome::DeadLettered {
            reason: DeadLetterReason::NonRetryable,
            ..
        }]
    ));

    let execs = h.ledger.all_executions();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].status, ExecutionStatus::Failed);
    assert_eq!(
        execs[0].error.as_ref().map(|e| e.kind),
        Some(ErrorKind::TaskNotFound)
    );
    assert!(h.ledger.all_retries().is_empty());

    let dlq = h.dead_letters.list_for_task(task.id).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].attempts, 1);
    assert_eq!(dlq[0].payload, json!({ "orphan": true }));
}

/// Leases the next fire of a per-second schedule, waiting for it to come due.
async fn lease_fire(h: &Harness) -> LeasedJob {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if let Some(leased) = h.queue.lease("worker-a", Duration::from_secs(5)).await.unwrap() {
            return leased;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no fire became due");
}

#[tokio::test]
async fn skipped_recurring_fire_does_not_count_as_a_run() {
    let h = Harness::new();
    let runner = h.runner(ok_handlers("tick"));

    let task = h
        .scheduler
        .create_task(NewTask::recurring("tick", "tests", json!({}), "* * * * * *"))
        .await
        .unwrap();
    h.scheduler.pause_task(task.id).await.unwrap();

    let fire = lease_fire(&h).await;
    let fired_at = fire.job.visible_at;
    assert_eq!(
        runner.process(fire).await.unwrap(),
        RunOutcome::Skipped {
            reason: "paused".into()
        }
    );

    let task = h.tasks.get_task(task.id).await.unwrap().unwrap();
    assert!(task.last_run_at.is_none());
    let next_run = task.next_run_at.expect("paused schedule stays armed");
    assert!(next_run > fired_at);

    let pending = h.queue.jobs_for_task(task.id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].visible_at, next_run);
    assert!(h.ledger.all_executions().is_empty());
}

#[tokio::test]
async fn rearming_during_a_fire_keeps_next_run_at() {
    let h = Harness::new();
    let runner = h.runner(ok_handlers("tick"));

    let task = h
        .scheduler
        .create_task(NewTask::recurring("tick", "tests", json!({}), "* * * * * *"))
        .await
        .unwrap();

    let fire = lease_fire(&h).await;
    // arms a fresh pending instance while the fire is still leased
    h.scheduler.resume_task(task.id).await.unwrap();

    assert!(matches!(
        runner.process(fire).await.unwrap(),
        RunOutcome::Completed { .. }
    ));

    let pending = h.queue.jobs_for_task(task.id).await.unwrap();
    assert_eq!(pending.len(), 1);

    let task = h.tasks.get_task(task.id).await.unwrap().unwrap();
    assert!(task.last_run_at.is_some());
    assert_eq!(task.next_run_at, Some(pending[0].visible_at));
}

#[tokio::test]
async fn ack_reports_a_pending_instance_armed_meanwhile() {
    let h = Harness::new();
    let spec = RecurringSpec {
        task_id: Uuid::new_v4(),
        schedule: CronSchedule::parse("* * * * * *").unwrap(),
        payload: json!({}),
        priority: 0,
        attempts_allowed: 1,
    };
    h.queue.enqueue_recurring(spec.clone()).await.unwrap();

    let fire = lease_fire(&h).await;
    let armed = h.queue.enqueue_recurring(spec).await.unwrap();

    assert_eq!(
        h.queue.ack(&fire.lease).await.unwrap(),
        AckOutcome::AlreadyArmed {
            pending_job_id: armed.job_id,
            next_run_at: armed.visible_at,
        }
    );
}

/// Queue whose admissions fail as if the broker were down.
struct RefusingQueue(InMemoryQueue);

fn refused() -> Error {
    Error::QueueUnavailable("connection refused".into())
}

#[async_trait]
impl DispatchQueue for RefusingQueue {
    async fn enqueue(&self, _job: NewJob, _opts: EnqueueOptions) -> Result<Job> {
        Err(refused())
    }

    async fn enqueue_recurring(&self, _spec: RecurringSpec) -> Result<Job> {
        Err(refused())
    }

    async fn remove_recurring(&self, task_id: Uuid) -> Result<bool> {
        self.0.remove_recurring(task_id).await
    }

    async fn lease(&self, worker_id: &str, visibility: Duration) -> Result<Option<LeasedJob>> {
        self.0.lease(worker_id, visibility).await
    }

    async fn ack(&self, lease: &Lease) -> Result<AckOutcome> {
        self.0.ack(lease).await
    }

    async fn nack(&self, lease: &Lease, delay: Duration) -> Result<bool> {
        self.0.nack(lease, delay).await
    }

    async fn defer(&self, lease: &Lease, delay: Duration) -> Result<bool> {
        self.0.defer(lease, delay).await
    }

    async fn pause(&self) -> Result<()> {
        self.0.pause().await
    }

    async fn resume(&self) -> Result<()> {
        self.0.resume().await
    }

    async fn is_paused(&self) -> Result<bool> {
        self.0.is_paused().await
    }

    async fn reap_expired_leases(&self) -> Result<u64> {
        self.0.reap_expired_leases().await
    }

    async fn depth(&self) -> Result<QueueDepth> {
        self.0.depth().await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.0.get_job(job_id).await
    }

    async fn jobs_for_task(&self, task_id: Uuid) -> Result<Vec<Job>> {
        self.0.jobs_for_task(task_id).await
    }
}

#[tokio::test]
async fn task_is_abandoned_when_its_first_job_cannot_be_queued() {
    let h = Harness::new();
    let scheduler = TaskScheduler::new(
        h.tasks.clone(),
        Arc::new(RefusingQueue(InMemoryQueue::new())),
        h.dead_letters.clone(),
    );

    let err = scheduler
        .create_task(NewTask::one_time("demo_ok", "tests", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueUnavailable(_)), "{err}");

    let err = scheduler
        .create_task(NewTask::recurring("tick", "tests", json!({}), "0 0 * * *"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueUnavailable(_)), "{err}");

    let tasks = h.tasks.all_tasks();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.deleted_at.is_some() && !t.is_active()));
}
