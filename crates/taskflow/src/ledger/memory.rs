use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{ErrorKind, ExecutionError, Result};
use crate::ledger::{ExecutionLedger, ExecutionStatus, JobExecution, RetryRecord};

#[derive(Default)]
struct State {
    executions: Vec<JobExecution>,
    retries: Vec<RetryRecord>,
}

/// Append-ordered ledger held in memory.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every execution row, in insertion order.
    pub fn all_executions(&self) -> Vec<JobExecution> {
        self.state().executions.clone()
    }

    pub fn all_retries(&self) -> Vec<RetryRecord> {
        self.state().retries.clone()
    }

    fn close(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<ExecutionError>,
    ) -> bool {
        let mut st = self.state();
        match st
            .executions
            .iter_mut()
            .find(|e| e.id == execution_id && e.is_processing())
        {
            Some(exec) => {
                exec.finish(status, Utc::now());
                exec.result = result;
                exec.error = error;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ExecutionLedger for InMemoryLedger {
    async fn start_execution(
        &self,
        task_id: Uuid,
        job_id: Uuid,
        attempt: i32,
        worker_id: &str,
    ) -> Result<JobExecution> {
        let now = Utc::now();
        let mut st = self.state();

        for stale in st
            .executions
            .iter_mut()
            .filter(|e| e.job_id == job_id && e.is_processing())
        {
            tracing::warn!(
                job_id = %job_id,
                execution_id = %stale.id,
                attempt = stale.attempts,
                "closing stalled execution"
            );
            stale.finish(ExecutionStatus::Failed, now);
            stale.error = Some(ExecutionError::new(
                ErrorKind::Stalled,
                format!("worker {} lost its lease", stale.worker_id),
            ));
        }

        let exec = JobExecution::new(task_id, job_id, attempt, worker_id);
        st.executions.push(exec.clone());
        Ok(exec)
    }

    async fn complete_execution(&self, execution_id: Uuid, result: Value) -> Result<bool> {
        Ok(self.close(execution_id, ExecutionStatus::Completed, Some(result), None))
    }

    async fn fail_execution(&self, execution_id: Uuid, error: &ExecutionError) -> Result<bool> {
        Ok(self.close(
            execution_id,
            ExecutionStatus::Failed,
            None,
            Some(error.clone()),
        ))
    }

    async fn record_retry(
        &self,
        execution_id: Uuid,
        attempt_number: i32,
        error: &ExecutionError,
    ) -> Result<RetryRecord> {
        let record = RetryRecord {
            id: Uuid::new_v4(),
            execution_id,
            attempt_number,
            error: error.clone(),
            attempted_at: Utc::now(),
        };
        self.state().retries.push(record.clone());
        Ok(record)
    }

    async fn executions_for_job(&self, job_id: Uuid) -> Result<Vec<JobExecution>> {
        let mut out: Vec<JobExecution> = self
            .state()
            .executions
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.attempts, e.started_at));
        Ok(out)
    }

    async fn executions_for_task(&self, task_id: Uuid, limit: i64) -> Result<Vec<JobExecution>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(self
            .state()
            .executions
            .iter()
            .rev()
            .filter(|e| e.task_id == task_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn retries_for_execution(&self, execution_id: Uuid) -> Result<Vec<RetryRecord>> {
        Ok(self
            .state()
            .retries
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect())
    }
}
