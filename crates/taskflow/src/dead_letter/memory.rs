use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::dead_letter::{DeadLetterJob, DeadLetterStore, NewDeadLetter};
use crate::error::Result;

#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    jobs: Mutex<Vec<DeadLetterJob>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, Vec<DeadLetterJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn insert(&self, dl: NewDeadLetter) -> Result<Option<DeadLetterJob>> {
        let mut jobs = self.jobs();
        if jobs.iter().any(|j| j.job_id == dl.job_id) {
            return Ok(None);
        }

        let job = DeadLetterJob {
            id: Uuid::new_v4(),
            task_id: dl.task_id,
            job_id: dl.job_id,
            payload: dl.payload,
            suggested_action: dl.error.kind.suggested_action(),
            error: dl.error,
            attempts: dl.attempts,
            created_at: Utc::now(),
        };
        jobs.push(job.clone());
        Ok(Some(job))
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterJob>> {
        Ok(self.jobs().iter().find(|j| j.id == id).cloned())
    }

    async fn get_by_job(&self, job_id: Uuid) -> Result<Option<DeadLetterJob>> {
        Ok(self.jobs().iter().find(|j| j.job_id == job_id).cloned())
    }

    async fn list(&self, limit: i64) -> Result<Vec<DeadLetterJob>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(self.jobs().iter().rev().take(limit).cloned().collect())
    }

    async fn list_for_task(&self, task_id: Uuid) -> Result<Vec<DeadLetterJob>> {
        Ok(self
            .jobs()
            .iter()
            .rev()
            .filter(|j| j.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn remove(&self, id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs();
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        Ok(jobs.len() < before)
    }
}
