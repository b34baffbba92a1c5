// crates/taskflow/src/queue/pg.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::queue::{
    chrono_delay, schedule_key, AckOutcome, DispatchQueue, EnqueueOptions, Job, Lease, LeasedJob,
    NewJob, QueueDepth, RecurringSpec,
};
use crate::schedule::CronSchedule;
use crate::tasks::model::validate_priority;

const JOB_COLUMNS: &str = r#"
    job_id, task_id, payload, priority, attempts_allowed, attempts_made,
    schedule_key, visible_at, enqueued_at, leased_by, lease_expires_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    task_id: Uuid,
    payload: Value,
    priority: i32,
    attempts_allowed: i32,
    attempts_made: i32,
    schedule_key: Option<String>,
    visible_at: DateTime<Utc>,
    enqueued_at: DateTime<Utc>,
    leased_by: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl From<JobRow> for Job {
    fn from(r: JobRow) -> Self {
        Job {
            job_id: r.job_id,
            task_id: r.task_id,
            payload: r.payload,
            priority: r.priority,
            attempts_allowed: r.attempts_allowed,
            attempts_made: r.attempts_made,
            schedule_key: r.schedule_key,
            visible_at: r.visible_at,
            enqueued_at: r.enqueued_at,
            leased_by: r.leased_by,
            lease_expires_at: r.lease_expires_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScheduleRow {
    task_id: Uuid,
    expression: String,
    payload: Value,
    priority: i32,
    attempts_allowed: i32,
}

/// Transport failures surface as `QueueUnavailable` so the pool can back off
/// on them separately from task-level retries.
fn unavailable(e: sqlx::Error) -> Error {
    Error::QueueUnavailable(e.to_string())
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Postgres-backed dispatch queue. Claims use `FOR UPDATE SKIP LOCKED`, so
/// any number of worker processes can lease from the same table.
#[derive(Clone)]
pub struct PgDispatchQueue {
    pool: PgPool,
}

impl PgDispatchQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_scheduled(
        tx: &mut Transaction<'_, Postgres>,
        task_id: Uuid,
        payload: &Value,
        priority: i32,
        attempts_allowed: i32,
        next_run_at: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            INSERT INTO queue_jobs (job_id, task_id, payload, priority, attempts_allowed, schedule_key, visible_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (schedule_key) WHERE schedule_key IS NOT NULL AND lease_id IS NULL
            DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(task_id)
            .bind(payload)
            .bind(priority)
            .bind(attempts_allowed.max(1))
            .bind(schedule_key(task_id))
            .bind(next_run_at)
            .fetch_optional(&mut **tx)
            .await
            .map_err(unavailable)?;

        Ok(row.map(Job::from))
    }

    /// Returns a leased row to the ready set after `delay`. Any other pending
    /// instance of the same recurring schedule is dropped first so the
    /// one-pending-per-schedule index holds.
    async fn release_row(
        tx: &mut Transaction<'_, Postgres>,
        job_id: Uuid,
        delay_ms: i64,
        consume_attempt: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM queue_jobs p
            USING queue_jobs s
            WHERE s.job_id = $1
              AND s.schedule_key IS NOT NULL
              AND p.schedule_key = s.schedule_key
              AND p.lease_id IS NULL
              AND p.job_id <> s.job_id
            "#,
        )
        .bind(job_id)
        .execute(&mut **tx)
        .await
        .map_err(unavailable)?;

        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET lease_id = NULL,
                leased_by = NULL,
                lease_expires_at = NULL,
                attempts_made = attempts_made + CASE WHEN $3 THEN 1 ELSE 0 END,
                visible_at = CASE
                    WHEN $2 <= 0 THEN LEAST(visible_at, now())
                    ELSE now() + ($2::bigint * interval '1 millisecond')
                END
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(delay_ms)
        .bind(consume_attempt)
        .execute(&mut **tx)
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    async fn release(&self, lease: &Lease, delay: Duration, consume_attempt: bool) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let held: Option<Uuid> = sqlx::query_scalar(
            "SELECT job_id FROM queue_jobs WHERE job_id = $1 AND lease_id = $2 FOR UPDATE",
        )
        .bind(lease.job_id)
        .bind(lease.lease_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?;

        if held.is_none() {
            tx.rollback().await.map_err(unavailable)?;
            return Ok(false);
        }

        Self::release_row(&mut tx, lease.job_id, millis(delay), consume_attempt).await?;
        tx.commit().await.map_err(unavailable)?;
        Ok(true)
    }
}

#[async_trait]
impl DispatchQueue for PgDispatchQueue {
    async fn enqueue(&self, job: NewJob, opts: EnqueueOptions) -> Result<Job> {
        opts.validate()?;

        let sql = format!(
            r#"
            INSERT INTO queue_jobs (job_id, task_id, payload, priority, attempts_allowed, visible_at)
            VALUES ($1, $2, $3, $4, $5, now() + ($6::bigint * interval '1 millisecond'))
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(job.task_id)
            .bind(&job.payload)
            .bind(opts.priority)
            .bind(job.attempts_allowed.max(1))
            .bind(opts.delay.num_milliseconds())
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(row.into())
    }

    async fn enqueue_recurring(&self, spec: RecurringSpec) -> Result<Job> {
        validate_priority(spec.priority)?;
        let next_run_at = spec.schedule.next_after(Utc::now())?;
        let key = schedule_key(spec.task_id);

        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        sqlx::query(
            r#"
            INSERT INTO queue_schedules (schedule_key, task_id, expression, payload, priority, attempts_allowed)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (schedule_key) DO UPDATE
            SET expression = EXCLUDED.expression,
                payload = EXCLUDED.payload,
                priority = EXCLUDED.priority,
                attempts_allowed = EXCLUDED.attempts_allowed,
                updated_at = now()
            "#,
        )
        .bind(&key)
        .bind(spec.task_id)
        .bind(spec.schedule.expression())
        .bind(&spec.payload)
        .bind(spec.priority)
        .bind(spec.attempts_allowed)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        sqlx::query("DELETE FROM queue_jobs WHERE schedule_key = $1 AND lease_id IS NULL")
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

        let job = Self::insert_scheduled(
            &mut tx,
            spec.task_id,
            &spec.payload,
            spec.priority,
            spec.attempts_allowed,
            next_run_at,
        )
        .await?
        .ok_or_else(|| {
            Error::QueueUnavailable(format!("concurrent re-arm of schedule {key}"))
        })?;

        tx.commit().await.map_err(unavailable)?;
        Ok(job)
    }

    async fn remove_recurring(&self, task_id: Uuid) -> Result<bool> {
        let key = schedule_key(task_id);
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let res = sqlx::query("DELETE FROM queue_schedules WHERE schedule_key = $1")
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

        sqlx::query("DELETE FROM queue_jobs WHERE schedule_key = $1 AND lease_id IS NULL")
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        Ok(res.rows_affected() > 0)
    }

    async fn lease(&self, worker_id: &str, visibility: Duration) -> Result<Option<LeasedJob>> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let paused: Option<bool> =
            sqlx::query_scalar("SELECT paused FROM queue_controls WHERE id = 1")
                .fetch_optional(&mut *tx)
                .await
                .map_err(unavailable)?;
        if paused.unwrap_or(false) {
            tx.rollback().await.map_err(unavailable)?;
            return Ok(None);
        }

        let candidate: Option<(Uuid, bool)> = sqlx::query_as(
            r#"
            SELECT job_id, lease_id IS NOT NULL AS stalled
            FROM queue_jobs
            WHERE (lease_id IS NULL AND visible_at <= now())
               OR (lease_id IS NOT NULL AND lease_expires_at <= now())
            ORDER BY priority DESC, visible_at ASC, enqueue_seq ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?;

        let Some((job_id, stalled)) = candidate else {
            tx.rollback().await.map_err(unavailable)?;
            return Ok(None);
        };

        if stalled {
            tracing::warn!(job_id = %job_id, "reclaiming stalled job after lease expiry");
        }

        let lease_id = Uuid::new_v4();
        let sql = format!(
            r#"
            UPDATE queue_jobs
            SET lease_id = $2,
                leased_by = $3,
                lease_expires_at = now() + ($4::bigint * interval '1 millisecond'),
                attempts_made = attempts_made + CASE WHEN $5 THEN 1 ELSE 0 END
            WHERE job_id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .bind(lease_id)
            .bind(worker_id)
            .bind(millis(visibility))
            .bind(stalled)
            .fetch_one(&mut *tx)
            .await
            .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;

        let job = Job::from(row);
        let leased_until = job
            .lease_expires_at
            .unwrap_or_else(|| Utc::now() + chrono_delay(visibility));

        Ok(Some(LeasedJob {
            job,
            lease: Lease {
                job_id,
                lease_id,
                worker_id: worker_id.to_string(),
            },
            leased_until,
        }))
    }

    async fn ack(&self, lease: &Lease) -> Result<AckOutcome> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let removed: Option<(Option<String>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            DELETE FROM queue_jobs
            WHERE job_id = $1 AND lease_id = $2
            RETURNING schedule_key, visible_at
            "#,
        )
        .bind(lease.job_id)
        .bind(lease.lease_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?;

        let Some((key, fired_at)) = removed else {
            tx.rollback().await.map_err(unavailable)?;
            return Ok(AckOutcome::LeaseLost);
        };

        let Some(key) = key else {
            tx.commit().await.map_err(unavailable)?;
            return Ok(AckOutcome::Removed);
        };

        let schedule = sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT task_id, expression, payload, priority, attempts_allowed
            FROM queue_schedules
            WHERE schedule_key = $1
            "#,
        )
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?;

        let Some(schedule) = schedule else {
            tx.commit().await.map_err(unavailable)?;
            return Ok(AckOutcome::Removed);
        };

        let next_run_at = match CronSchedule::parse(&schedule.expression)
            .and_then(|s| s.next_after(fired_at.max(Utc::now())))
        {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(task_id = %schedule.task_id, error = %e, "recurring schedule has no next fire time");
                tx.commit().await.map_err(unavailable)?;
                return Ok(AckOutcome::Removed);
            }
        };

        // A pending instance (from a concurrent re-registration) wins the
        // conflict and nothing new is armed.
        let next = Self::insert_scheduled(
            &mut tx,
            schedule.task_id,
            &schedule.payload,
            schedule.priority,
            schedule.attempts_allowed,
            next_run_at,
        )
        .await?;

        let outcome = match next {
            Some(job) => AckOutcome::Rearmed {
                next_job_id: job.job_id,
                next_run_at: job.visible_at,
            },
            None => {
                let pending: Option<(Uuid, DateTime<Utc>)> = sqlx::query_as(
                    r#"
                    SELECT job_id, visible_at
                    FROM queue_jobs
                    WHERE schedule_key = $1 AND lease_id IS NULL
                    "#,
                )
                .bind(&key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(unavailable)?;

                match pending {
                    Some((pending_job_id, next_run_at)) => AckOutcome::AlreadyArmed {
                        pending_job_id,
                        next_run_at,
                    },
                    None => AckOutcome::Removed,
                }
            }
        };

        tx.commit().await.map_err(unavailable)?;
        Ok(outcome)
    }

    async fn nack(&self, lease: &Lease, delay: Duration) -> Result<bool> {
        self.release(lease, delay, true).await
    }

    async fn defer(&self, lease: &Lease, delay: Duration) -> Result<bool> {
        self.release(lease, delay, false).await
    }

    async fn pause(&self) -> Result<()> {
        sqlx::query("UPDATE queue_controls SET paused = true, updated_at = now() WHERE id = 1")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        sqlx::query("UPDATE queue_controls SET paused = false, updated_at = now() WHERE id = 1")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        let paused: Option<bool> =
            sqlx::query_scalar("SELECT paused FROM queue_controls WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;
        Ok(paused.unwrap_or(false))
    }

    async fn reap_expired_leases(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let expired: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT job_id
            FROM queue_jobs
            WHERE lease_id IS NOT NULL
              AND lease_expires_at <= now()
            ORDER BY lease_expires_at ASC
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(unavailable)?;

        for job_id in &expired {
            tracing::warn!(job_id = %job_id, "lease expired; returning job to the ready set");
            Self::release_row(&mut tx, *job_id, 0, true).await?;
        }

        tx.commit().await.map_err(unavailable)?;
        Ok(expired.len() as u64)
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let (ready, delayed, leased): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (
                    WHERE (lease_id IS NULL AND visible_at <= now())
                       OR (lease_id IS NOT NULL AND lease_expires_at <= now())
                ) AS ready,
                COUNT(*) FILTER (WHERE lease_id IS NULL AND visible_at > now()) AS delayed,
                COUNT(*) FILTER (WHERE lease_id IS NOT NULL AND lease_expires_at > now()) AS leased
            FROM queue_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;

        let schedules: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_schedules")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(QueueDepth {
            ready,
            delayed,
            leased,
            schedules,
            paused: self.is_paused().await?,
        })
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE job_id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(row.map(Job::from))
    }

    async fn jobs_for_task(&self, task_id: Uuid) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM queue_jobs WHERE task_id = $1 ORDER BY enqueue_seq ASC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(rows.into_iter().map(Job::from).collect())
    }
}
