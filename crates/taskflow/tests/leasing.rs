mod common;

use common::{wait_until, Harness};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskflow::jobs::{boxed, HandlerRegistry, RunOutcome};
use taskflow::ledger::{ExecutionLedger, ExecutionStatus};
use taskflow::queue::{AckOutcome, DispatchQueue, EnqueueOptions, InMemoryQueue, NewJob};
use taskflow::tasks::NewTask;
use taskflow::ErrorKind;
use uuid::Uuid;

fn new_job(task_id: Uuid) -> NewJob {
    NewJob {
        task_id,
        payload: json!({}),
        attempts_allowed: 3,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_lease_the_same_job() {
    let queue = Arc::new(InMemoryQueue::new());
    let task_id = Uuid::new_v4();
    for _ in 0..50 {
        queue
            .enqueue(new_job(task_id), EnqueueOptions::default())
            .await
            .unwrap();
    }

    let mut workers = Vec::new();
    for w in 0..4 {
        let queue = queue.clone();
        workers.push(tokio::spawn(async move {
            let worker_id = format!("worker-{w}");
            let mut seen = Vec::new();
            while let Some(leased) = queue
                .lease(&worker_id, Duration::from_secs(30))
                .await
                .unwrap()
            {
                seen.push(leased.job.job_id);
                tokio::task::yield_now().await;
            }
            seen
        }));
    }

    let mut all = Vec::new();
    for w in workers {
        all.extend(w.await.unwrap());
    }
    let unique: HashSet<Uuid> = all.iter().copied().collect();
    assert_eq!(all.len(), 50);
    assert_eq!(unique.len(), 50);
}

#[tokio::test]
async fn higher_priority_is_leased_first() {
    let queue = InMemoryQueue::new();
    for priority in [1, 9, 5] {
        queue
            .enqueue(
                new_job(Uuid::new_v4()),
                EnqueueOptions {
                    priority,
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();
    }

    let mut order = Vec::new();
    while let Some(leased) = queue.lease("w1", Duration::from_secs(30)).await.unwrap() {
        order.push(leased.job.priority);
    }
    assert_eq!(order, vec![9, 5, 1]);
}

#[tokio::test]
async fn equal_priority_is_leased_in_enqueue_order() {
    let queue = InMemoryQueue::new();
    let opts = EnqueueOptions {
        priority: 4,
        ..EnqueueOptions::default()
    };

    let mut enqueued = Vec::new();
    for _ in 0..5 {
        let job = queue.enqueue(new_job(Uuid::new_v4()), opts).await.unwrap();
        enqueued.push(job.job_id);
    }
    let urgent = queue
        .enqueue(
            new_job(Uuid::new_v4()),
            EnqueueOptions {
                priority: 8,
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(leased) = queue.lease("w1", Duration::from_secs(30)).await.unwrap() {
        order.push(leased.job.job_id);
    }
    assert_eq!(order[0], urgent.job_id);
    assert_eq!(order[1..], enqueued[..]);
}

#[tokio::test]
async fn paused_queue_hands_out_nothing() {
    let queue = InMemoryQueue::new();
    queue
        .enqueue(new_job(Uuid::new_v4()), EnqueueOptions::default())
        .await
        .unwrap();

    queue.pause().await.unwrap();
    assert!(queue.is_paused().await.unwrap());
    assert!(queue.lease("w1", Duration::from_secs(30)).await.unwrap().is_none());

    queue.resume().await.unwrap();
    assert!(queue.lease("w1", Duration::from_secs(30)).await.unwrap().is_some());
}

#[tokio::test]
async fn stalled_job_is_recovered_by_another_worker() {
    let h = Harness::new();
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("demo_ok", |_task, _payload, _ctx| {
        boxed(async move { Ok(json!({ "ok": true })) })
    });
    let runner = h.runner(handlers);

    let task = h
        .scheduler
        .create_task(NewTask::one_time("demo_ok", "tests", json!({})))
        .await
        .unwrap();

    // worker-a leases, opens its execution row and then dies
    let first = h
        .queue
        .lease("worker-a", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    h.ledger
        .start_execution(task.id, first.job.job_id, first.attempt(), "worker-a")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(h.queue.reap_expired_leases().await.unwrap(), 1);

    let second = h
        .queue
        .lease("worker-b", Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.job.job_id, first.job.job_id);
    assert_eq!(second.attempt(), 2);
    assert_eq!(second.job.leased_by.as_deref(), Some("worker-b"));

    // the dead worker's lease no longer counts
    assert_eq!(h.queue.ack(&first.lease).await.unwrap(), AckOutcome::LeaseLost);

    let outcome = runner.process(second).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));

    let execs = h.ledger.executions_for_job(first.job.job_id).await.unwrap();
    assert_eq!(execs.len(), 2);
    assert_eq!(execs[0].worker_id, "worker-a");
    assert_eq!(execs[0].status, ExecutionStatus::Failed);
    assert_eq!(
        execs[0].error.as_ref().map(|e| e.kind),
        Some(ErrorKind::Stalled)
    );
    assert_eq!(execs[1].worker_id, "worker-b");
    assert_eq!(execs[1].status, ExecutionStatus::Completed);
    assert_eq!(execs[1].attempts, 2);
}

#[tokio::test]
async fn expired_lease_is_reclaimed_directly_by_lease() {
    let queue = InMemoryQueue::new();
    queue
        .enqueue(new_job(Uuid::new_v4()), EnqueueOptions::default())
        .await
        .unwrap();

    let first = queue.lease("w1", Duration::from_millis(30)).await.unwrap().unwrap();
    assert!(queue.lease("w2", Duration::from_secs(5)).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(60)).await;
    let second = queue.lease("w2", Duration::from_secs(5)).await.unwrap().unwrap();
    assert_eq!(second.job.job_id, first.job.job_id);
    assert_eq!(second.job.attempts_made, 1);
    assert!(!queue.nack(&first.lease, Duration::ZERO).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_runs_every_job_exactly_once() {
    let h = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handlers = HandlerRegistry::new();
    let counter = calls.clone();
    handlers.register_fn("count", move |_task, _payload, _ctx| {
        let counter = counter.clone();
        boxed(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        })
    });

    for i in 0..20 {
        h.scheduler
            .create_task(NewTask::one_time("count", "tests", json!({ "i": i })))
            .await
            .unwrap();
    }

    let pool = h.pool(handlers, "worker-a", 4).spawn();
    let ledger = h.ledger.clone();
    let done = wait_until(Duration::from_secs(5), || {
        let ledger = ledger.clone();
        async move {
            ledger
                .all_executions()
                .iter()
                .filter(|e| e.status == ExecutionStatus::Completed)
                .count()
                == 20
        }
    })
    .await;
    pool.shutdown().await;

    assert!(done, "pool did not finish 20 jobs");
    assert_eq!(calls.load(Ordering::SeqCst), 20);
    assert_eq!(h.ledger.all_executions().len(), 20);

    let depth = h.queue.depth().await.unwrap();
    assert_eq!(depth.ready + depth.delayed + depth.leased, 0);
    assert!(h.stats.snapshot().completed >= 20);
}
