use chrono::{DateTime, DurationRound, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::events::{EventSink, PipelineEvent};
use crate::ledger::ExecutionStatus;
use crate::queue::QueueDepth;

const DURATION_SAMPLES: usize = 1_024;
const TREND_MINUTES: usize = 60;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TrendBucket {
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendPoint {
    pub minute: DateTime<Utc>,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub at: DateTime<Utc>,

    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub skipped: u64,

    pub success_rate: f64,
    pub retry_rate: f64,

    pub mean_duration_ms: f64,
    pub p50_duration_ms: Option<i64>,
    pub p95_duration_ms: Option<i64>,
    pub p99_duration_ms: Option<i64>,

    pub queue: Option<QueueDepth>,
    pub trend: Vec<TrendPoint>,
}

#[derive(Default)]
struct Inner {
    started: u64,
    completed: u64,
    failed: u64,
    retried: u64,
    dead_lettered: u64,
    skipped: u64,
    durations: VecDeque<i64>,
    queue: Option<QueueDepth>,
    trend: BTreeMap<DateTime<Utc>, TrendBucket>,
}

/// In-process consumer of pipeline events: counters, the last queue depth, a
/// bounded duration sample and per-minute completed/failed buckets.
#[derive(Default)]
pub struct StatsAggregator {
    inner: Mutex<Inner>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner();

        let finished = inner.completed + inner.failed;
        let success_rate = if finished > 0 {
            inner.completed as f64 / finished as f64
        } else {
            0.0
        };
        let retry_rate = if inner.started > 0 {
            inner.retried as f64 / inner.started as f64
        } else {
            0.0
        };

        let mut sorted: Vec<i64> = inner.durations.iter().copied().collect();
        sorted.sort_unstable();
        let mean_duration_ms = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<i64>() as f64 / sorted.len() as f64
        };

        StatsSnapshot {
            at: Utc::now(),
            started: inner.started,
            completed: inner.completed,
            failed: inner.failed,
            retried: inner.retried,
            dead_lettered: inner.dead_lettered,
            skipped: inner.skipped,
            success_rate,
            retry_rate,
            mean_duration_ms,
            p50_duration_ms: percentile(&sorted, 50.0),
            p95_duration_ms: percentile(&sorted, 95.0),
            p99_duration_ms: percentile(&sorted, 99.0),
            queue: inner.queue.clone(),
            trend: inner
                .trend
                .iter()
                .map(|(minute, b)| TrendPoint {
                    minute: *minute,
                    completed: b.completed,
                    failed: b.failed,
                })
                .collect(),
        }
    }
}

/// Nearest-rank percentile over an ascending slice.
fn percentile(sorted: &[i64], p: f64) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted.get(rank.clamp(1, sorted.len()) - 1).copied()
}

fn minute_of(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(chrono::Duration::minutes(1)).unwrap_or(at)
}

impl EventSink for StatsAggregator {
    fn emit(&self, event: &PipelineEvent) {
        let mut guard = self.inner();
        let inner = &mut *guard;
        match event {
            PipelineEvent::AttemptStarted { .. } => inner.started += 1,
            PipelineEvent::AttemptFinished {
                status,
                duration_ms,
                at,
                ..
            } => {
                let bucket = inner.trend.entry(minute_of(*at)).or_default();
                if *status == ExecutionStatus::Completed {
                    bucket.completed += 1;
                    inner.completed += 1;
                } else {
                    bucket.failed += 1;
                    inner.failed += 1;
                }
                while inner.trend.len() > TREND_MINUTES {
                    inner.trend.pop_first();
                }

                if inner.durations.len() == DURATION_SAMPLES {
                    inner.durations.pop_front();
                }
                inner.durations.push_back(*duration_ms);
            }
            PipelineEvent::JobSkipped { .. } => inner.skipped += 1,
            PipelineEvent::RetryScheduled { .. } => inner.retried += 1,
            PipelineEvent::DeadLettered { .. } => inner.dead_lettered += 1,
            PipelineEvent::QueueDepth { depth, .. } => inner.queue = Some(depth.clone()),
        }
    }
}
