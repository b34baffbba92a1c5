//! In-process dispatch queue for embedding, development and tests.
//!
//! All state sits behind one mutex, so every operation is atomic with respect
//! to every other; no lock is held across an `.await`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::queue::{
    chrono_delay, schedule_key, AckOutcome, DispatchQueue, EnqueueOptions, Job, Lease, LeasedJob,
    NewJob, QueueDepth, RecurringSpec,
};
use crate::tasks::model::validate_priority;

#[derive(Debug)]
struct Entry {
    job: Job,
    seq: u64,
    lease_id: Option<Uuid>,
}

impl Entry {
    fn is_pending(&self) -> bool {
        self.lease_id.is_none()
    }

    fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        self.lease_id.is_some() && self.job.lease_expires_at.map_or(true, |t| t <= now)
    }

    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        (self.is_pending() && self.job.visible_at <= now) || self.is_stalled(now)
    }

    fn holds(&self, lease: &Lease) -> bool {
        self.lease_id == Some(lease.lease_id)
    }

    fn release(&mut self, visible_at: DateTime<Utc>) {
        self.lease_id = None;
        self.job.leased_by = None;
        self.job.lease_expires_at = None;
        self.job.visible_at = visible_at;
    }
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<Uuid, Entry>,
    schedules: HashMap<String, RecurringSpec>,
    next_seq: u64,
    paused: bool,
}

impl State {
    fn insert(&mut self, job: Job) -> Job {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.jobs.insert(
            job.job_id,
            Entry {
                job: job.clone(),
                seq,
                lease_id: None,
            },
        );
        job
    }

    /// Releasing a leased recurring instance drops any other pending instance
    /// of the same schedule, so at most one stays outstanding.
    fn release(&mut self, job_id: Uuid, visible_at: DateTime<Utc>, consume_attempt: bool) {
        let key = self.jobs.get(&job_id).and_then(|e| e.job.schedule_key.clone());
        if let Some(key) = key {
            self.jobs.retain(|id, e| {
                *id == job_id || !(e.is_pending() && e.job.schedule_key.as_deref() == Some(key.as_str()))
            });
        }
        if let Some(entry) = self.jobs.get_mut(&job_id) {
            if consume_attempt {
                entry.job.attempts_made += 1;
            }
            entry.release(visible_at);
        }
    }

    fn pending_for(&self, key: &str) -> Option<&Job> {
        self.jobs
            .values()
            .find(|e| e.is_pending() && e.job.schedule_key.as_deref() == Some(key))
            .map(|e| &e.job)
    }

    /// Arms the next instance of a recurring schedule, strictly after `after`.
    fn arm(&mut self, spec: &RecurringSpec, after: DateTime<Utc>) -> Result<Job> {
        let now = Utc::now();
        let next_run_at = spec.schedule.next_after(after)?;
        let job = Job {
            job_id: Uuid::new_v4(),
            task_id: spec.task_id,
            payload: spec.payload.clone(),
            priority: spec.priority,
            attempts_allowed: spec.attempts_allowed,
            attempts_made: 0,
            schedule_key: Some(schedule_key(spec.task_id)),
            visible_at: next_run_at,
            enqueued_at: now,
            leased_by: None,
            lease_expires_at: None,
        };
        Ok(self.insert(job))
    }
}

#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, lease: &Lease, delay: Duration, consume_attempt: bool) -> bool {
        let visible_at = Utc::now() + chrono_delay(delay);
        let mut st = self.state();
        if !st.jobs.get(&lease.job_id).is_some_and(|e| e.holds(lease)) {
            return false;
        }
        st.release(lease.job_id, visible_at, consume_attempt);
        true
    }
}

#[async_trait]
impl DispatchQueue for InMemoryQueue {
    async fn enqueue(&self, job: NewJob, opts: EnqueueOptions) -> Result<Job> {
        opts.validate()?;

        let now = Utc::now();
        let job = Job {
            job_id: Uuid::new_v4(),
            task_id: job.task_id,
            payload: job.payload,
            priority: opts.priority,
            attempts_allowed: job.attempts_allowed.max(1),
            attempts_made: 0,
            schedule_key: None,
            visible_at: now + opts.delay,
            enqueued_at: now,
            leased_by: None,
            lease_expires_at: None,
        };

        Ok(self.state().insert(job))
    }

    async fn enqueue_recurring(&self, spec: RecurringSpec) -> Result<Job> {
        validate_priority(spec.priority)?;

        let key = schedule_key(spec.task_id);
        let mut st = self.state();
        st.jobs
            .retain(|_, e| !(e.is_pending() && e.job.schedule_key.as_deref() == Some(key.as_str())));
        st.schedules.insert(key, spec.clone());
        st.arm(&spec, Utc::now())
    }

    async fn remove_recurring(&self, task_id: Uuid) -> Result<bool> {
        let key = schedule_key(task_id);
        let mut st = self.state();
        let existed = st.schedules.remove(&key).is_some();
        st.jobs
            .retain(|_, e| !(e.is_pending() && e.job.schedule_key.as_deref() == Some(key.as_str())));
        Ok(existed)
    }

    async fn lease(&self, worker_id: &str, visibility: Duration) -> Result<Option<LeasedJob>> {
        let now = Utc::now();
        let mut st = self.state();
        if st.paused {
            return Ok(None);
        }

        let candidate = st
            .jobs
            .values()
            .filter(|e| e.is_ready(now))
            .max_by(|a, b| {
                a.job
                    .priority
                    .cmp(&b.job.priority)
                    .then_with(|| b.job.visible_at.cmp(&a.job.visible_at))
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|e| e.job.job_id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };
        let Some(entry) = st.jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        if entry.lease_id.is_some() {
            tracing::warn!(
                job_id = %job_id,
                previous_worker = ?entry.job.leased_by,
                "reclaiming stalled job after lease expiry"
            );
            entry.job.attempts_made += 1;
        }

        let lease_id = Uuid::new_v4();
        let leased_until = now + chrono_delay(visibility);
        entry.lease_id = Some(lease_id);
        entry.job.leased_by = Some(worker_id.to_string());
        entry.job.lease_expires_at = Some(leased_until);

        Ok(Some(LeasedJob {
            job: entry.job.clone(),
            lease: Lease {
                job_id,
                lease_id,
                worker_id: worker_id.to_string(),
            },
            leased_until,
        }))
    }

    async fn ack(&self, lease: &Lease) -> Result<AckOutcome> {
        let mut st = self.state();
        let holds = st.jobs.get(&lease.job_id).is_some_and(|e| e.holds(lease));
        if !holds {
            return Ok(AckOutcome::LeaseLost);
        }

        let Some(entry) = st.jobs.remove(&lease.job_id) else {
            return Ok(AckOutcome::LeaseLost);
        };

        let Some(key) = entry.job.schedule_key.as_deref() else {
            return Ok(AckOutcome::Removed);
        };
        if let Some(pending) = st.pending_for(key) {
            return Ok(AckOutcome::AlreadyArmed {
                pending_job_id: pending.job_id,
                next_run_at: pending.visible_at,
            });
        }
        let Some(spec) = st.schedules.get(key).cloned() else {
            return Ok(AckOutcome::Removed);
        };

        let after = entry.job.visible_at.max(Utc::now());
        match st.arm(&spec, after) {
            Ok(next) => Ok(AckOutcome::Rearmed {
                next_job_id: next.job_id,
                next_run_at: next.visible_at,
            }),
            Err(e) => {
                tracing::warn!(task_id = %spec.task_id, error = %e, "recurring schedule has no next fire time");
                Ok(AckOutcome::Removed)
            }
        }
    }

    async fn nack(&self, lease: &Lease, delay: Duration) -> Result<bool> {
        Ok(self.release(lease, delay, true))
    }

    async fn defer(&self, lease: &Lease, delay: Duration) -> Result<bool> {
        Ok(self.release(lease, delay, false))
    }

    async fn pause(&self) -> Result<()> {
        self.state().paused = true;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.state().paused = false;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        Ok(self.state().paused)
    }

    async fn reap_expired_leases(&self) -> Result<u64> {
        let now = Utc::now();
        let mut st = self.state();
        let stalled: Vec<(Uuid, DateTime<Utc>)> = st
            .jobs
            .values()
            .filter(|e| e.is_stalled(now))
            .map(|e| (e.job.job_id, e.job.visible_at.min(now)))
            .collect();
        for (job_id, visible_at) in &stalled {
            tracing::warn!(job_id = %job_id, "lease expired; returning job to the ready set");
            st.release(*job_id, *visible_at, true);
        }
        Ok(stalled.len() as u64)
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let now = Utc::now();
        let st = self.state();
        let mut depth = QueueDepth {
            schedules: st.schedules.len() as i64,
            paused: st.paused,
            ..QueueDepth::default()
        };
        for e in st.jobs.values() {
            if e.is_ready(now) {
                depth.ready += 1;
            } else if e.is_pending() {
                depth.delayed += 1;
            } else {
                depth.leased += 1;
            }
        }
        Ok(depth)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.state().jobs.get(&job_id).map(|e| e.job.clone()))
    }

    async fn jobs_for_task(&self, task_id: Uuid) -> Result<Vec<Job>> {
        let st = self.state();
        let mut entries: Vec<&Entry> = st
            .jobs
            .values()
            .filter(|e| e.job.task_id == task_id)
            .collect();
        entries.sort_by_key(|e| e.seq);
        Ok(entries.into_iter().map(|e| e.job.clone()).collect())
    }
}
