use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Sliding-window limiter on attempt starts per task, shared by every slot of
/// a worker pool.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    starts: Mutex<HashMap<Uuid, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            starts: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records a start for `task_id` if fewer than `limit` happened within the
    /// window. Returns false when throttled.
    pub fn try_acquire(&self, task_id: Uuid, limit: u32) -> bool {
        self.try_acquire_at(task_id, limit, Instant::now())
    }

    fn try_acquire_at(&self, task_id: Uuid, limit: u32, now: Instant) -> bool {
        let window = self.window;
        let mut starts = self.starts.lock().unwrap_or_else(|e| e.into_inner());

        // tasks whose latest start left the window have nothing left to count
        starts.retain(|_, q| q.back().is_some_and(|t| now.saturating_duration_since(*t) < window));

        if limit == 0 {
            return false;
        }
        let q = starts.entry(task_id).or_default();
        while q
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            q.pop_front();
        }
        if q.len() >= limit as usize {
            return false;
        }
        q.push_back(now);
        true
    }

    #[cfg(test)]
    fn tracked_tasks(&self) -> usize {
        self.starts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
