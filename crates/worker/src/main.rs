use std::sync::Arc;

use taskflow::api;
use taskflow::config;
use taskflow::db;
use taskflow::dead_letter::PgDeadLetterStore;
use taskflow::events::{EventBus, EventSink, LogSink};
use taskflow::jobs::{JobRunner, RateLimiter, WorkerPool};
use taskflow::ledger::PgLedger;
use taskflow::queue::PgDispatchQueue;
use taskflow::stats::StatsAggregator;
use taskflow::tasks::{PgTaskStore, TaskScheduler};
use taskflow::telemetry;

mod handlers;
use handlers::build_registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    telemetry::init_tracing(&cfg.log());

    let registry = build_registry();
    tracing::info!(
        worker_id = %cfg.worker_id,
        concurrency = cfg.concurrency,
        visibility_timeout_ms = cfg.visibility_timeout_ms,
        retry_base_ms = cfg.retry_base_ms,
        retry_max_ms = cfg.retry_max_ms,
        admin_addr = cfg.admin_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        handlers = ?registry.names(),
        "taskflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let tasks = Arc::new(PgTaskStore::new(pool.clone()));
    let queue = Arc::new(PgDispatchQueue::new(pool.clone()));
    let ledger = Arc::new(PgLedger::new(pool.clone()));
    let dead_letters = Arc::new(PgDeadLetterStore::new(pool.clone()));

    let stats = Arc::new(StatsAggregator::new());
    let events: Arc<dyn EventSink> = Arc::new(
        EventBus::new()
            .with_sink(Arc::new(LogSink))
            .with_sink(stats.clone()),
    );

    let runner = JobRunner::new(
        tasks.clone(),
        queue.clone(),
        ledger.clone(),
        dead_letters.clone(),
        registry,
        events,
        Arc::new(RateLimiter::new(cfg.rate_limit_window())),
        cfg.retry(),
        cfg.throttle_delay(),
    );
    let pool_handle = WorkerPool::new(runner, cfg.pool()).spawn();

    // ---- API task ----
    let api_state = api::ApiState {
        queue: queue.clone(),
        ledger,
        dead_letters: dead_letters.clone(),
        scheduler: TaskScheduler::new(tasks, queue, dead_letters),
        stats,
    };
    let app = api::router(api_state);
    let api_addr = cfg.admin_addr.clone();
    let api_shutdown = pool_handle.shutdown_token();

    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "admin api listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
                .await?;
        }
        Ok::<(), anyhow::Error>(())
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    pool_handle.shutdown().await;

    match api_handle.await {
        Ok(res) => res?,
        Err(e) => tracing::error!(error = %e, "admin api task failed"),
    }

    tracing::info!("taskflow worker stopped");
    Ok(())
}
