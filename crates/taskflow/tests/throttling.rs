mod common;

use chrono::Utc;
use common::Harness;
use serde_json::{json, Value};
use std::time::Duration;
use taskflow::jobs::{boxed, HandlerRegistry, RunOutcome};
use taskflow::ledger::{ExecutionLedger, ExecutionStatus};
use taskflow::queue::{DispatchQueue, EnqueueOptions, NewJob};
use taskflow::tasks::NewTask;

#[tokio::test]
async fn over_limit_job_is_deferred_without_consuming_an_attempt() {
    let h = Harness::new();
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("report", |_task, _payload, _ctx| boxed(async move { Ok(Value::Null) }));
    let runner = h.runner(handlers);

    let task = h
        .scheduler
        .create_task(NewTask::one_time("report", "tests", json!({})).rate_limit(1))
        .await
        .unwrap();
    let extra = h
        .queue
        .enqueue(
            NewJob {
                task_id: task.id,
                payload: json!({ "extra": true }),
                attempts_allowed: task.attempts_allowed(),
            },
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    let first = h.queue.lease("worker-a", Duration::from_secs(5)).await.unwrap().unwrap();
    assert!(matches!(
        runner.process(first).await.unwrap(),
        RunOutcome::Completed { .. }
    ));

    let second = h.queue.lease("worker-a", Duration::from_secs(5)).await.unwrap().unwrap();
    assert_eq!(second.job.job_id, extra.job_id);
    assert_eq!(runner.process(second).await.unwrap(), RunOutcome::Throttled);

    let deferred = h.queue.get_job(extra.job_id).await.unwrap().unwrap();
    assert_eq!(deferred.attempts_made, 0);
    assert!(deferred.leased_by.is_none());
    assert!(deferred.visible_at > Utc::now());
    assert!(h.ledger.executions_for_job(extra.job_id).await.unwrap().is_empty());

    // once the window slides the deferred job runs as its first attempt
    let outcomes = h.drive(&runner, "worker-a").await;
    assert!(matches!(outcomes.last(), Some(RunOutcome::Completed { .. })));
    assert!(outcomes[..outcomes.len() - 1]
        .iter()
        .all(|o| *o == RunOutcome::Throttled));

    let execs = h.ledger.executions_for_job(extra.job_id).await.unwrap();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].attempts, 1);
    assert_eq!(execs[0].status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn unlimited_tasks_are_never_throttled() {
    let h = Harness::new();
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("report", |_task, _payload, _ctx| boxed(async move { Ok(Value::Null) }));
    let runner = h.runner(handlers);

    for _ in 0..5 {
        h.scheduler
            .create_task(NewTask::one_time("report", "tests", json!({})))
            .await
            .unwrap();
    }

    while let Some(leased) = h.queue.lease("worker-a", Duration::from_secs(5)).await.unwrap() {
        assert!(matches!(
            runner.process(leased).await.unwrap(),
            RunOutcome::Completed { .. }
        ));
    }
    assert_eq!(h.ledger.all_executions().len(), 5);
}
