use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::Result;
use crate::tasks::model::{NewTask, Task, TaskStatus};

/// Durable record of task definitions, as seen by the pipeline.
///
/// Status fields are last-write-wins: concurrent status updates are not
/// coordinated here.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Returns soft-deleted tasks too (with `deleted_at` set); `None` only when
    /// the row is gone.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;

    async fn insert_task(&self, task: NewTask) -> Result<Task>;

    /// A `None` `last_run_at` leaves the stored value untouched.
    async fn update_task_run_times(
        &self,
        id: Uuid,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Returns false when the task does not exist or is deleted.
    async fn set_status(&self, id: Uuid, status: TaskStatus) -> Result<bool>;

    /// Marks the task `COMPLETED` with `deleted_at`; rows are never removed.
    async fn soft_delete(&self, id: Uuid) -> Result<bool>;
}

/// Mutex-guarded task table for embedding and tests.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<Uuid, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<Uuid, Task>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Physically removes a task row. Only useful to simulate a dangling job
    /// whose task was hard-deleted behind the pipeline's back.
    pub fn hard_delete(&self, id: Uuid) -> bool {
        self.tasks().remove(&id).is_some()
    }

    pub fn all_tasks(&self) -> Vec<Task> {
        self.tasks().values().cloned().collect()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.tasks().get(&id).cloned())
    }

    async fn insert_task(&self, new: NewTask) -> Result<Task> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            owner: new.owner,
            task_type: new.task_type,
            status: TaskStatus::Active,
            schedule_expression: new.schedule_expression,
            scheduled_at: new.scheduled_at,
            priority: new.priority,
            payload: new.payload,
            max_retries: new.max_retries,
            timeout_ms: new.timeout_ms,
            rate_limit: new.rate_limit,
            last_run_at: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.tasks().insert(task.id, task.clone());
        Ok(task)
    }

    async fn update_task_run_times(
        &self,
        id: Uuid,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if let Some(task) = self.tasks().get_mut(&id) {
            if last_run_at.is_some() {
                task.last_run_at = last_run_at;
            }
            task.next_run_at = next_run_at;
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_status(&self, id: Uuid, status: TaskStatus) -> Result<bool> {
        match self.tasks().get_mut(&id) {
            Some(task) if task.deleted_at.is_none() => {
                task.status = status;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn soft_delete(&self, id: Uuid) -> Result<bool> {
        match self.tasks().get_mut(&id) {
            Some(task) if task.deleted_at.is_none() => {
                let now = Utc::now();
                task.status = TaskStatus::Completed;
                task.deleted_at = Some(now);
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
