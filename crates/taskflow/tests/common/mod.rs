use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use taskflow::dead_letter::InMemoryDeadLetterStore;
use taskflow::events::EventSink;
use taskflow::jobs::{HandlerRegistry, JobRunner, PoolConfig, RateLimiter, RetryConfig, RunOutcome, WorkerPool};
use taskflow::ledger::InMemoryLedger;
use taskflow::queue::{DispatchQueue, InMemoryQueue};
use taskflow::stats::StatsAggregator;
use taskflow::tasks::{InMemoryTaskStore, TaskScheduler};

pub const RETRY_BASE_MS: u64 = 20;
pub const THROTTLE_DELAY: Duration = Duration::from_millis(50);

/// In-memory pipeline wired the same way the worker wires the Postgres one.
#[allow(dead_code)]
pub struct Harness {
    pub tasks: Arc<InMemoryTaskStore>,
    pub queue: Arc<InMemoryQueue>,
    pub ledger: Arc<InMemoryLedger>,
    pub dead_letters: Arc<InMemoryDeadLetterStore>,
    pub stats: Arc<StatsAggregator>,
    pub scheduler: TaskScheduler,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        let tasks = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        let scheduler = TaskScheduler::new(tasks.clone(), queue.clone(), dead_letters.clone());
        Self {
            tasks,
            queue,
            ledger,
            dead_letters,
            stats: Arc::new(StatsAggregator::new()),
            scheduler,
        }
    }

    pub fn retry_config() -> RetryConfig {
        RetryConfig {
            base_ms: RETRY_BASE_MS,
            max_ms: 200,
            jitter_pct: 0.0, // deterministic test
        }
    }

    pub fn runner(&self, handlers: HandlerRegistry) -> JobRunner {
        let events: Arc<dyn EventSink> = self.stats.clone();
        JobRunner::new(
            self.tasks.clone(),
            self.queue.clone(),
            self.ledger.clone(),
            self.dead_letters.clone(),
            Arc::new(handlers),
            events,
            Arc::new(RateLimiter::new(Duration::from_secs(1))),
            Self::retry_config(),
            THROTTLE_DELAY,
        )
    }

    pub fn pool(&self, handlers: HandlerRegistry, worker_id: &str, concurrency: usize) -> WorkerPool {
        WorkerPool::new(self.runner(handlers), fast_pool_config(worker_id, concurrency))
    }

    pub async fn drive(&self, runner: &JobRunner, worker_id: &str) -> Vec<RunOutcome> {
        drive(self.queue.as_ref(), runner, worker_id).await
    }
}

/// Leases and processes jobs as `worker_id` until one reaches a terminal
/// outcome, waiting out retry delays in between.
#[allow(dead_code)]
pub async fn drive(queue: &dyn DispatchQueue, runner: &JobRunner, worker_id: &str) -> Vec<RunOutcome> {
    let mut outcomes = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    while tokio::time::Instant::now() < deadline {
        let leased = queue.lease(worker_id, Duration::from_secs(5)).await.unwrap();
        let Some(leased) = leased else {
            tokio::time::sleep(Duration::from_millis(5)).await;
            continue;
        };

        let outcome = runner.process(leased).await.unwrap();
        let done = matches!(
            outcome,
            RunOutcome::Completed { .. } | RunOutcome::DeadLettered { .. } | RunOutcome::Skipped { .. }
        );
        outcomes.push(outcome);
        if done {
            break;
        }
    }
    outcomes
}

#[allow(dead_code)]
pub fn fast_pool_config(worker_id: &str, concurrency: usize) -> PoolConfig {
    PoolConfig {
        worker_id: worker_id.to_string(),
        concurrency,
        visibility_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        reap_interval: Duration::from_millis(20),
        shutdown_grace: Duration::from_secs(2),
        ..PoolConfig::default()
    }
}

/// Polls `check` until it returns true or `timeout` elapses.
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Connects to `TEST_DATABASE_URL`, migrates and truncates. Returns `None`
/// when the variable is unset so Postgres tests skip on machines without one.
#[allow(dead_code)]
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping postgres test");
        return None;
    };

    let pool = taskflow::db::make_pool(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");
    taskflow::db::run_migrations(&pool)
        .await
        .expect("migrations failed");
    taskflow::db::reset(&pool).await.expect("truncate failed");

    Some(pool)
}
