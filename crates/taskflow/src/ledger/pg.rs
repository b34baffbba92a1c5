// crates/taskflow/src/ledger/pg.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, ErrorKind, ExecutionError, Result};
use crate::ledger::{ExecutionLedger, ExecutionStatus, JobExecution, RetryRecord};

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    task_id: Uuid,
    job_id: Uuid,
    status: String,
    attempts: i32,
    worker_id: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    result: Option<Value>,
    error: Option<Value>,
}

impl TryFrom<ExecutionRow> for JobExecution {
    type Error = Error;

    fn try_from(r: ExecutionRow) -> Result<Self> {
        let status = ExecutionStatus::parse(&r.status).ok_or_else(|| {
            Error::Storage(sqlx::Error::Decode(
                format!("unknown execution status {}", r.status).into(),
            ))
        })?;
        let error = r.error.map(serde_json::from_value).transpose()?;

        Ok(JobExecution {
            id: r.id,
            task_id: r.task_id,
            job_id: r.job_id,
            status,
            attempts: r.attempts,
            worker_id: r.worker_id,
            started_at: r.started_at,
            completed_at: r.completed_at,
            duration_ms: r.duration_ms,
            result: r.result,
            error,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RetryRow {
    id: Uuid,
    execution_id: Uuid,
    attempt_number: i32,
    error: Value,
    attempted_at: DateTime<Utc>,
}

impl TryFrom<RetryRow> for RetryRecord {
    type Error = Error;

    fn try_from(r: RetryRow) -> Result<Self> {
        Ok(RetryRecord {
            id: r.id,
            execution_id: r.execution_id,
            attempt_number: r.attempt_number,
            error: serde_json::from_value(r.error)?,
            attempted_at: r.attempted_at,
        })
    }
}

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Single-writer close: only a row still `PROCESSING` is updated.
    async fn close(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        result: Option<&Value>,
        error: Option<Value>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = $2,
                completed_at = now(),
                duration_ms = GREATEST(0, (EXTRACT(EPOCH FROM (now() - started_at)) * 1000)::bigint),
                result = $3,
                error = $4
            WHERE id = $1
              AND status = 'PROCESSING'
            "#,
        )
        .bind(execution_id)
        .bind(status.as_str())
        .bind(result)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() > 0)
    }
}

#[async_trait]
impl ExecutionLedger for PgLedger {
    async fn start_execution(
        &self,
        task_id: Uuid,
        job_id: Uuid,
        attempt: i32,
        worker_id: &str,
    ) -> Result<JobExecution> {
        let mut tx = self.pool.begin().await?;

        let stale_error = ExecutionError::new(
            ErrorKind::Stalled,
            "previous worker lost its lease before finishing",
        )
        .to_json();

        let closed = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = 'FAILED',
                completed_at = now(),
                duration_ms = GREATEST(0, (EXTRACT(EPOCH FROM (now() - started_at)) * 1000)::bigint),
                error = $2
            WHERE job_id = $1
              AND status = 'PROCESSING'
            "#,
        )
        .bind(job_id)
        .bind(&stale_error)
        .execute(&mut *tx)
        .await?;

        if closed.rows_affected() > 0 {
            tracing::warn!(job_id = %job_id, attempt, "closed stalled execution");
        }

        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            INSERT INTO job_executions (id, task_id, job_id, status, attempts, worker_id)
            VALUES ($1, $2, $3, 'PROCESSING', $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(task_id)
        .bind(job_id)
        .bind(attempt)
        .bind(worker_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        JobExecution::try_from(row)
    }

    async fn complete_execution(&self, execution_id: Uuid, result: Value) -> Result<bool> {
        self.close(execution_id, ExecutionStatus::Completed, Some(&result), None)
            .await
    }

    async fn fail_execution(&self, execution_id: Uuid, error: &ExecutionError) -> Result<bool> {
        self.close(
            execution_id,
            ExecutionStatus::Failed,
            None,
            Some(error.to_json()),
        )
        .await
    }

    async fn record_retry(
        &self,
        execution_id: Uuid,
        attempt_number: i32,
        error: &ExecutionError,
    ) -> Result<RetryRecord> {
        let row = sqlx::query_as::<_, RetryRow>(
            r#"
            INSERT INTO retry_records (id, execution_id, attempt_number, error)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(execution_id)
        .bind(attempt_number)
        .bind(error.to_json())
        .fetch_one(&self.pool)
        .await?;

        RetryRecord::try_from(row)
    }

    async fn executions_for_job(&self, job_id: Uuid) -> Result<Vec<JobExecution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT *
            FROM job_executions
            WHERE job_id = $1
            ORDER BY attempts ASC, started_at ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobExecution::try_from).collect()
    }

    async fn executions_for_task(&self, task_id: Uuid, limit: i64) -> Result<Vec<JobExecution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT *
            FROM job_executions
            WHERE task_id = $1
            ORDER BY started_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(task_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobExecution::try_from).collect()
    }

    async fn retries_for_execution(&self, execution_id: Uuid) -> Result<Vec<RetryRecord>> {
        let rows = sqlx::query_as::<_, RetryRow>(
            r#"
            SELECT *
            FROM retry_records
            WHERE execution_id = $1
            ORDER BY attempted_at ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RetryRecord::try_from).collect()
    }
}
