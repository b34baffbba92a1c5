//! Execution ledger: one row per attempt plus the retry sub-log. This is the
//! audit trail and the source of truth for attempt status.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ExecutionError, Result};

pub mod memory;
pub mod model;
pub mod pg;

pub use memory::InMemoryLedger;
pub use model::{ExecutionStatus, JobExecution, RetryRecord};
pub use pg::PgLedger;

#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    /// Opens a `PROCESSING` row for `attempt`. A row still `PROCESSING` for the
    /// same job (left behind by a crashed worker) is closed `FAILED` with
    /// `STALLED` first.
    async fn start_execution(
        &self,
        task_id: Uuid,
        job_id: Uuid,
        attempt: i32,
        worker_id: &str,
    ) -> Result<JobExecution>;

    /// Moves a `PROCESSING` row to `COMPLETED`. Returns false when the row was
    /// already closed, so a late result never overwrites a timeout.
    async fn complete_execution(&self, execution_id: Uuid, result: Value) -> Result<bool>;

    /// Moves a `PROCESSING` row to `FAILED`. Same single-writer guard as
    /// [`ExecutionLedger::complete_execution`].
    async fn fail_execution(&self, execution_id: Uuid, error: &ExecutionError) -> Result<bool>;

    async fn record_retry(
        &self,
        execution_id: Uuid,
        attempt_number: i32,
        error: &ExecutionError,
    ) -> Result<RetryRecord>;

    /// Ordered by attempt number.
    async fn executions_for_job(&self, job_id: Uuid) -> Result<Vec<JobExecution>>;

    /// Most recent first, at most `limit` rows.
    async fn executions_for_task(&self, task_id: Uuid, limit: i64) -> Result<Vec<JobExecution>>;

    async fn retries_for_execution(&self, execution_id: Uuid) -> Result<Vec<RetryRecord>>;
}
