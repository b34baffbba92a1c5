// crates/taskflow/src/tasks/pg.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::tasks::model::{NewTask, Task, TaskStatus, TaskType};
use crate::tasks::store::TaskStore;

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    owner: String,
    task_type: String,
    status: String,
    schedule_expression: Option<String>,
    scheduled_at: Option<DateTime<Utc>>,
    priority: i32,
    payload: Value,
    max_retries: i32,
    timeout_ms: i64,
    rate_limit: Option<i32>,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        let task_type = TaskType::parse(&row.task_type).ok_or_else(|| {
            Error::Storage(sqlx::Error::Decode(
                format!("unknown task_type {}", row.task_type).into(),
            ))
        })?;
        let status = TaskStatus::parse(&row.status).ok_or_else(|| {
            Error::Storage(sqlx::Error::Decode(
                format!("unknown task status {}", row.status).into(),
            ))
        })?;

        Ok(Task {
            id: row.id,
            name: row.name,
            description: row.description,
            owner: row.owner,
            task_type,
            status,
            schedule_expression: row.schedule_expression,
            scheduled_at: row.scheduled_at,
            priority: row.priority,
            payload: row.payload,
            max_retries: row.max_retries,
            timeout_ms: row.timeout_ms,
            rate_limit: row.rate_limit,
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Task::try_from).transpose()
    }

    async fn insert_task(&self, task: NewTask) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            INSERT INTO tasks (
                id, name, description, owner, task_type, status,
                schedule_expression, scheduled_at,
                priority, payload, max_retries, timeout_ms, rate_limit
            )
            VALUES ($1, $2, $3, $4, $5, 'ACTIVE', $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&task.name)
        .bind(&task.description)
        .bind(&task.owner)
        .bind(task.task_type.as_str())
        .bind(&task.schedule_expression)
        .bind(task.scheduled_at)
        .bind(task.priority)
        .bind(&task.payload)
        .bind(task.max_retries)
        .bind(task.timeout_ms)
        .bind(task.rate_limit)
        .fetch_one(&self.pool)
        .await?;

        Task::try_from(row)
    }

    async fn update_task_run_times(
        &self,
        id: Uuid,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET last_run_at = COALESCE($2, last_run_at),
                next_run_at = $3,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(last_run_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_status(&self, id: Uuid, status: TaskStatus) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2,
                updated_at = now()
            WHERE id = $1
              AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn soft_delete(&self, id: Uuid) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'COMPLETED',
                deleted_at = now(),
                updated_at = now()
            WHERE id = $1
              AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() > 0)
    }
}
