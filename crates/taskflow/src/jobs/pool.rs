use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::PipelineEvent;
use crate::jobs::runner::{JobRunner, RunOutcome};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub worker_id: String,
    /// Max attempts in flight in this process.
    pub concurrency: usize,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    pub reap_interval: Duration,
    pub shutdown_grace: Duration,
    pub infra_backoff_base: Duration,
    pub infra_backoff_max: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            concurrency: 10,
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            reap_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
            infra_backoff_base: Duration::from_millis(100),
            infra_backoff_max: Duration::from_secs(5),
        }
    }
}

/// Bounded-concurrency lease loop. Each leased job runs on its own task so a
/// slow handler never holds up leasing for the other slots.
pub struct WorkerPool {
    runner: JobRunner,
    cfg: PoolConfig,
}

/// Handle to a spawned pool.
pub struct PoolHandle {
    shutdown: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl PoolHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops leasing, waits for in-flight attempts up to the configured grace,
    /// then returns. Attempts still running after the grace are abandoned and
    /// come back through stall recovery.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "worker pool task failed");
        }
    }
}

impl WorkerPool {
    pub fn new(runner: JobRunner, cfg: PoolConfig) -> Self {
        Self { runner, cfg }
    }

    pub fn spawn(self) -> PoolHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        PoolHandle { shutdown, join }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let cfg = &self.cfg;
        let queue = self.runner.queue().clone();
        let slots = Arc::new(Semaphore::new(cfg.concurrency.max(1)));
        let mut in_flight: JoinSet<Result<RunOutcome>> = JoinSet::new();
        let mut last_reap: Option<Instant> = None;
        let mut infra_failures: u32 = 0;

        tracing::info!(
            worker_id = %cfg.worker_id,
            concurrency = cfg.concurrency,
            visibility_ms = cfg.visibility_timeout.as_millis() as u64,
            "worker pool started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // reclaim jobs from dead workers on a fixed interval to avoid hot-loop write load.
            if last_reap.map_or(true, |t| t.elapsed() >= cfg.reap_interval) {
                last_reap = Some(Instant::now());
                self.reap_and_report().await;
            }

            while let Some(joined) = in_flight.try_join_next() {
                log_joined(&cfg.worker_id, joined);
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                p = slots.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            match queue.lease(&cfg.worker_id, cfg.visibility_timeout).await {
                Ok(Some(leased)) => {
                    infra_failures = 0;
                    tracing::debug!(
                        worker_id = %cfg.worker_id,
                        job_id = %leased.job.job_id,
                        task_id = %leased.job.task_id,
                        attempt = leased.attempt(),
                        "leased job"
                    );
                    let runner = self.runner.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        runner.process(leased).await
                    });
                }
                Ok(None) => {
                    infra_failures = 0;
                    drop(permit);
                    if !sleep_or_cancel(&shutdown, cfg.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    infra_failures = infra_failures.saturating_add(1);
                    let delay = infra_backoff(infra_failures, cfg);
                    if e.is_retriable_infra() {
                        tracing::warn!(
                            worker_id = %cfg.worker_id,
                            error = %e,
                            failures = infra_failures,
                            delay_ms = delay.as_millis() as u64,
                            "lease failed; backing off"
                        );
                    } else {
                        tracing::error!(worker_id = %cfg.worker_id, error = %e, "lease failed");
                    }
                    if !sleep_or_cancel(&shutdown, delay).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            worker_id = %cfg.worker_id,
            in_flight = in_flight.len(),
            "worker pool stopping; draining in-flight attempts"
        );

        let drained = tokio::time::timeout(cfg.shutdown_grace, async {
            while let Some(joined) = in_flight.join_next().await {
                log_joined(&cfg.worker_id, joined);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                worker_id = %cfg.worker_id,
                abandoned = in_flight.len(),
                "shutdown grace elapsed; abandoning in-flight attempts"
            );
            in_flight.abort_all();
        }

        tracing::info!(worker_id = %cfg.worker_id, "worker pool stopped");
    }

    async fn reap_and_report(&self) {
        let queue = self.runner.queue();
        match queue.reap_expired_leases().await {
            Ok(n) if n > 0 => {
                tracing::info!(worker_id = %self.cfg.worker_id, reaped = n, "reaped expired leases")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(worker_id = %self.cfg.worker_id, error = %e, "reap failed"),
        }

        match queue.depth().await {
            Ok(depth) => self.runner.events().emit(&PipelineEvent::QueueDepth {
                depth,
                at: chrono::Utc::now(),
            }),
            Err(e) => tracing::debug!(error = %e, "queue depth unavailable"),
        }
    }
}

fn log_joined(worker_id: &str, joined: std::result::Result<Result<RunOutcome>, JoinError>) {
    match joined {
        Ok(Ok(outcome)) => tracing::trace!(%worker_id, ?outcome, "job processed"),
        Ok(Err(e)) => tracing::error!(
            %worker_id,
            error = %e,
            "job processing failed; lease will expire and the job will be retried"
        ),
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::error!(%worker_id, error = %e, "job task panicked"),
    }
}

/// Returns false when shutdown fired before `dur` elapsed.
async fn sleep_or_cancel(shutdown: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(dur) => true,
    }
}

fn infra_backoff(failures: u32, cfg: &PoolConfig) -> Duration {
    let exp = failures.saturating_sub(1).min(20);
    cfg.infra_backoff_base
        .saturating_mul(1_u32 << exp)
        .min(cfg.infra_backoff_max)
}
