//! Dead-letter store: terminal quarantine for jobs that exhausted retries or
//! failed with a non-retryable error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ExecutionError, Result};

pub mod memory;
pub mod pg;

pub use memory::InMemoryDeadLetterStore;
pub use pg::PgDeadLetterStore;

/// Never mutated after creation. Removed only by replay or purge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterJob {
    pub id: Uuid,
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub payload: Value,
    pub error: ExecutionError,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub suggested_action: &'static str,
}

#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub payload: Value,
    pub error: ExecutionError,
    pub attempts: i32,
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// At most one record per `job_id`: returns `None` when the job was
    /// already dead-lettered.
    async fn insert(&self, dl: NewDeadLetter) -> Result<Option<DeadLetterJob>>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterJob>>;

    async fn get_by_job(&self, job_id: Uuid) -> Result<Option<DeadLetterJob>>;

    /// Most recent first.
    async fn list(&self, limit: i64) -> Result<Vec<DeadLetterJob>>;

    async fn list_for_task(&self, task_id: Uuid) -> Result<Vec<DeadLetterJob>>;

    async fn remove(&self, id: Uuid) -> Result<bool>;
}
