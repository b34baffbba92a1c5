//! Admission path: the only way task definitions enter the pipeline.
//! Validation failures are returned to the caller and never reach the queue.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::dead_letter::DeadLetterStore;
use crate::error::{Error, Result};
use crate::queue::{DispatchQueue, EnqueueOptions, Job, NewJob, RecurringSpec};
use crate::schedule::CronSchedule;
use crate::tasks::model::{NewTask, Task, TaskStatus, TaskType};
use crate::tasks::store::TaskStore;

#[derive(Clone)]
pub struct TaskScheduler {
    tasks: Arc<dyn TaskStore>,
    queue: Arc<dyn DispatchQueue>,
    dead_letters: Arc<dyn DeadLetterStore>,
}

impl TaskScheduler {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        queue: Arc<dyn DispatchQueue>,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        Self {
            tasks,
            queue,
            dead_letters,
        }
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.tasks
            .get_task(id)
            .await?
            .filter(|t| t.deleted_at.is_none())
            .ok_or(Error::TaskNotFound(id))
    }

    /// Validates, persists and enqueues a task. One-time and delayed tasks get
    /// a single job due at `scheduledAt`; recurring tasks get a schedule.
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        let schedule = new.validate()?;
        let task = self.tasks.insert_task(new).await?;

        let admitted = match (task.task_type, schedule) {
            (TaskType::Recurring, Some(schedule)) => self.arm_recurring(&task, schedule).await,
            _ => self.enqueue_once(&task).await.inspect(|job| {
                tracing::info!(
                    task_id = %task.id,
                    job_id = %job.job_id,
                    task_type = task.task_type.as_str(),
                    visible_at = %job.visible_at,
                    "task admitted"
                );
            }),
        };

        if let Err(err) = admitted {
            self.abandon(&task, &err).await;
            return Err(err);
        }

        self.get_task(task.id).await
    }

    /// Soft-deletes a task whose first job could not be queued, so no active
    /// task is left without work. Cleanup failures are logged; the caller
    /// still sees the original error.
    async fn abandon(&self, task: &Task, cause: &Error) {
        tracing::error!(task_id = %task.id, error = %cause, "enqueue failed; abandoning task");

        if task.is_recurring() {
            if let Err(e) = self.queue.remove_recurring(task.id).await {
                tracing::warn!(task_id = %task.id, error = %e, "could not drop schedule of abandoned task");
            }
        }
        if let Err(e) = self.tasks.soft_delete(task.id).await {
            tracing::warn!(task_id = %task.id, error = %e, "could not soft-delete abandoned task");
        }
    }

    pub async fn pause_task(&self, id: Uuid) -> Result<Task> {
        let task = self.get_task(id).await?;
        if !self.tasks.set_status(id, TaskStatus::Paused).await? {
            return Err(Error::TaskNotFound(id));
        }
        tracing::info!(task_id = %task.id, "task paused");
        self.get_task(id).await
    }

    /// Re-activates a paused task. Recurring schedules are re-armed; this is
    /// idempotent, so resuming an active task is harmless.
    pub async fn resume_task(&self, id: Uuid) -> Result<Task> {
        let task = self.get_task(id).await?;
        if task.status == TaskStatus::Completed {
            return Err(Error::TaskInactive {
                task_id: id,
                status: task.status,
            });
        }
        if !self.tasks.set_status(id, TaskStatus::Active).await? {
            return Err(Error::TaskNotFound(id));
        }

        if let Some(schedule) = task.schedule().transpose()? {
            self.arm_recurring(&task, schedule).await?;
        }
        tracing::info!(task_id = %task.id, "task resumed");
        self.get_task(id).await
    }

    /// Soft delete: status `COMPLETED`, `deletedAt` set, recurring schedule
    /// dropped. Jobs already queued are skipped when leased.
    pub async fn delete_task(&self, id: Uuid) -> Result<()> {
        let task = self.get_task(id).await?;
        if !self.tasks.soft_delete(id).await? {
            return Err(Error::TaskNotFound(id));
        }
        if task.is_recurring() {
            self.queue.remove_recurring(id).await?;
            self.tasks.update_task_run_times(id, None, None).await?;
        }
        tracing::info!(task_id = %id, "task deleted");
        Ok(())
    }

    /// Re-enqueues a dead-lettered payload as a fresh job with a full attempt
    /// budget, then removes the dead-letter record.
    pub async fn replay_dead_letter(&self, id: Uuid) -> Result<Job> {
        let dl = self
            .dead_letters
            .get(id)
            .await?
            .ok_or(Error::DeadLetterNotFound(id))?;

        let task = self.get_task(dl.task_id).await?;
        if !task.is_active() {
            return Err(Error::TaskInactive {
                task_id: task.id,
                status: task.status,
            });
        }

        let job = self
            .queue
            .enqueue(
                NewJob {
                    task_id: task.id,
                    payload: dl.payload.clone(),
                    attempts_allowed: task.attempts_allowed(),
                },
                EnqueueOptions {
                    delay: chrono::Duration::zero(),
                    priority: task.priority,
                },
            )
            .await?;
        self.dead_letters.remove(id).await?;

        tracing::info!(
            dead_letter_id = %id,
            task_id = %task.id,
            old_job_id = %dl.job_id,
            new_job_id = %job.job_id,
            "dead letter replayed"
        );
        Ok(job)
    }

    pub async fn purge_dead_letter(&self, id: Uuid) -> Result<()> {
        if !self.dead_letters.remove(id).await? {
            return Err(Error::DeadLetterNotFound(id));
        }
        tracing::info!(dead_letter_id = %id, "dead letter purged");
        Ok(())
    }

    async fn enqueue_once(&self, task: &Task) -> Result<Job> {
        let delay = task
            .scheduled_at
            .map(|at| at - Utc::now())
            .unwrap_or_else(chrono::Duration::zero)
            .max(chrono::Duration::zero());

        self.queue
            .enqueue(
                NewJob {
                    task_id: task.id,
                    payload: task.payload.clone(),
                    attempts_allowed: task.attempts_allowed(),
                },
                EnqueueOptions {
                    delay,
                    priority: task.priority,
                },
            )
            .await
    }

    async fn arm_recurring(&self, task: &Task, schedule: CronSchedule) -> Result<Job> {
        let job = self
            .queue
            .enqueue_recurring(RecurringSpec {
                task_id: task.id,
                schedule,
                payload: task.payload.clone(),
                priority: task.priority,
                attempts_allowed: task.attempts_allowed(),
            })
            .await?;

        self.tasks
            .update_task_run_times(task.id, None, Some(job.visible_at))
            .await?;

        tracing::info!(
            task_id = %task.id,
            job_id = %job.job_id,
            next_run_at = %job.visible_at,
            "recurring schedule armed"
        );
        Ok(job)
    }
}
