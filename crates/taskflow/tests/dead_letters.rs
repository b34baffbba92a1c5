mod common;

use common::Harness;
use serde_json::{json, Value};
use taskflow::dead_letter::{DeadLetterStore, NewDeadLetter};
use taskflow::jobs::timeline::TimelineEvent;
use taskflow::jobs::{boxed, build_timeline, HandlerError, HandlerRegistry, RunOutcome};
use taskflow::ledger::ExecutionStatus;
use taskflow::queue::DispatchQueue;
use taskflow::tasks::{NewTask, Task};
use taskflow::{Error, ErrorKind, ExecutionError};
use uuid::Uuid;

fn failing() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("sync_crm", |_task, _payload, _ctx| {
        boxed(async move { Err(HandlerError::failed("crm rejected the batch").with_detail("HTTP 502")) })
    });
    handlers
}

fn succeeding() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("sync_crm", |_task, payload, _ctx| boxed(async move { Ok(payload) }));
    handlers
}

/// Creates a task whose single job has already been dead-lettered.
async fn dead_lettered_task(h: &Harness, max_retries: i32) -> (Task, Uuid) {
    let task = h
        .scheduler
        .create_task(
            NewTask::one_time("sync_crm", "tests", json!({ "batch": 42 })).max_retries(max_retries),
        )
        .await
        .unwrap();
    let outcomes = h.drive(&h.runner(failing()), "worker-a").await;
    assert!(matches!(outcomes.last(), Some(RunOutcome::DeadLettered { .. })));

    let dl = h.dead_letters.list_for_task(task.id).await.unwrap();
    assert_eq!(dl.len(), 1);
    (task, dl[0].id)
}

#[tokio::test]
async fn replay_enqueues_a_fresh_job_and_removes_the_record() {
    let h = Harness::new();
    let (task, dl_id) = dead_lettered_task(&h, 0).await;
    let old_job_id = h.dead_letters.get(dl_id).await.unwrap().unwrap().job_id;

    let job = h.scheduler.replay_dead_letter(dl_id).await.unwrap();
    assert_ne!(job.job_id, old_job_id);
    assert_eq!(job.task_id, task.id);
    assert_eq!(job.attempts_made, 0);
    assert_eq!(job.attempts_allowed, task.attempts_allowed());
    assert_eq!(job.payload, json!({ "batch": 42 }));
    assert!(h.dead_letters.get(dl_id).await.unwrap().is_none());

    let outcomes = h.drive(&h.runner(succeeding()), "worker-b").await;
    assert!(matches!(outcomes.as_slice(), [RunOutcome::Completed { .. }]));

    let execs = h.ledger.all_executions();
    let last = execs.last().unwrap();
    assert_eq!(last.job_id, job.job_id);
    assert_eq!(last.attempts, 1);
    assert_eq!(last.result, Some(json!({ "batch": 42 })));
}

#[tokio::test]
async fn replay_requires_an_active_task() {
    let h = Harness::new();
    let (task, dl_id) = dead_lettered_task(&h, 0).await;

    h.scheduler.pause_task(task.id).await.unwrap();
    let err = h.scheduler.replay_dead_letter(dl_id).await.unwrap_err();
    assert!(matches!(err, Error::TaskInactive { .. }), "{err}");
    assert!(h.dead_letters.get(dl_id).await.unwrap().is_some());

    let err = h
        .scheduler
        .replay_dead_letter(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeadLetterNotFound(_)), "{err}");
}

#[tokio::test]
async fn purge_deletes_the_record_once() {
    let h = Harness::new();
    let (_task, dl_id) = dead_lettered_task(&h, 0).await;

    h.scheduler.purge_dead_letter(dl_id).await.unwrap();
    assert!(h.dead_letters.get(dl_id).await.unwrap().is_none());
    assert!(matches!(
        h.scheduler.purge_dead_letter(dl_id).await,
        Err(Error::DeadLetterNotFound(_))
    ));
}

#[tokio::test]
async fn dead_letter_insert_is_idempotent_per_job() {
    let h = Harness::new();
    let job_id = Uuid::new_v4();
    let record = || NewDeadLetter {
        task_id: Uuid::new_v4(),
        job_id,
        payload: Value::Null,
        error: ExecutionError::new(ErrorKind::Handler, "boom"),
        attempts: 3,
    };

    assert!(h.dead_letters.insert(record()).await.unwrap().is_some());
    assert!(h.dead_letters.insert(record()).await.unwrap().is_none());
    assert_eq!(h.dead_letters.list(10).await.unwrap().len(), 1);
}

fn count(story: &[TimelineEvent], pred: impl Fn(&TimelineEvent) -> bool) -> usize {
    story.iter().filter(|e| pred(e)).count()
}

#[tokio::test]
async fn timeline_tells_the_whole_story() {
    let h = Harness::new();
    let (task, dl_id) = dead_lettered_task(&h, 2).await;
    let job_id = h.dead_letters.get(dl_id).await.unwrap().unwrap().job_id;

    let tl = build_timeline(h.queue.as_ref(), h.ledger.as_ref(), h.dead_letters.as_ref(), job_id)
        .await
        .unwrap()
        .expect("timeline exists");

    assert_eq!(tl.task_id, task.id);
    assert_eq!(tl.status, ExecutionStatus::DeadLetter);
    assert!(tl.queued.is_none());
    assert_eq!(tl.last_worker_id.as_deref(), Some("worker-a"));
    assert_eq!(tl.attempts.len(), 3);
    assert_eq!(tl.attempts[2].error_code, Some("HANDLER_ERROR"));
    assert_eq!(tl.dead_letter.as_ref().map(|d| d.id), Some(dl_id));

    let last_error = tl.last_error.as_ref().unwrap();
    assert_eq!(last_error.error_code, "HANDLER_ERROR");
    assert_eq!(last_error.error_message, "crm rejected the batch");

    let story = &tl.story;
    assert_eq!(count(story, |e| matches!(e, TimelineEvent::Attempt { .. })), 3);
    assert_eq!(count(story, |e| matches!(e, TimelineEvent::RetryScheduled { .. })), 2);
    assert_eq!(count(story, |e| matches!(e, TimelineEvent::DeadLettered { .. })), 1);
    assert!(matches!(tl.story.last(), Some(TimelineEvent::DeadLettered { .. })));

    let body = serde_json::to_value(&tl).unwrap();
    assert_eq!(body["status"], "DEAD_LETTER");
    assert_eq!(body["story"][0]["kind"], "Attempt");
}

#[tokio::test]
async fn timeline_of_a_waiting_job_is_pending() {
    let h = Harness::new();
    let task = h
        .scheduler
        .create_task(NewTask::one_time("sync_crm", "tests", json!({})))
        .await
        .unwrap();
    let jobs = h.queue.jobs_for_task(task.id).await.unwrap();
    assert_eq!(jobs.len(), 1);

    let tl = build_timeline(
        h.queue.as_ref(),
        h.ledger.as_ref(),
        h.dead_letters.as_ref(),
        jobs[0].job_id,
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(tl.status, ExecutionStatus::Pending);
    assert!(tl.attempts.is_empty());
    assert!(tl.queued.is_some());

    assert!(build_timeline(
        h.queue.as_ref(),
        h.ledger.as_ref(),
        h.dead_letters.as_ref(),
        Uuid::new_v4(),
    )
    .await
    .unwrap()
    .is_none());
}
