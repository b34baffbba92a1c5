// crates/taskflow/src/dead_letter/pg.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::dead_letter::{DeadLetterJob, DeadLetterStore, NewDeadLetter};
use crate::error::{Error, ExecutionError, Result};

#[derive(Debug, sqlx::FromRow)]
struct DeadLetterRow {
    id: Uuid,
    task_id: Uuid,
    job_id: Uuid,
    payload: Value,
    error: Value,
    attempts: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeadLetterRow> for DeadLetterJob {
    type Error = Error;

    fn try_from(r: DeadLetterRow) -> Result<Self> {
        let error: ExecutionError = serde_json::from_value(r.error)?;
        Ok(DeadLetterJob {
            id: r.id,
            task_id: r.task_id,
            job_id: r.job_id,
            payload: r.payload,
            suggested_action: error.kind.suggested_action(),
            error,
            attempts: r.attempts,
            created_at: r.created_at,
        })
    }
}

#[derive(Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn insert(&self, dl: NewDeadLetter) -> Result<Option<DeadLetterJob>> {
        let row = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            INSERT INTO dead_letter_jobs (id, task_id, job_id, payload, error, attempts)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (job_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(dl.task_id)
        .bind(dl.job_id)
        .bind(&dl.payload)
        .bind(dl.error.to_json())
        .bind(dl.attempts)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeadLetterJob::try_from).transpose()
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterJob>> {
        let row = sqlx::query_as::<_, DeadLetterRow>("SELECT * FROM dead_letter_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(DeadLetterJob::try_from).transpose()
    }

    async fn get_by_job(&self, job_id: Uuid) -> Result<Option<DeadLetterJob>> {
        let row =
            sqlx::query_as::<_, DeadLetterRow>("SELECT * FROM dead_letter_jobs WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(DeadLetterJob::try_from).transpose()
    }

    async fn list(&self, limit: i64) -> Result<Vec<DeadLetterJob>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT *
            FROM dead_letter_jobs
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeadLetterJob::try_from).collect()
    }

    async fn list_for_task(&self, task_id: Uuid) -> Result<Vec<DeadLetterJob>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT *
            FROM dead_letter_jobs
            WHERE task_id = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeadLetterJob::try_from).collect()
    }

    async fn remove(&self, id: Uuid) -> Result<bool> {
        let res = sqlx::query("DELETE FROM dead_letter_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(res.rows_affected() > 0)
    }
}
