//! Fire-and-forget pipeline events.
//!
//! Sinks are called synchronously on the hot path and must not block. A sink
//! can neither fail nor stall the pipeline: panics are caught and logged,
//! channel overflow drops the event.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::ledger::ExecutionStatus;
use crate::queue::QueueDepth;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    AttemptStarted {
        task_id: Uuid,
        job_id: Uuid,
        execution_id: Uuid,
        attempt: i32,
        worker_id: String,
        at: DateTime<Utc>,
    },
    AttemptFinished {
        task_id: Uuid,
        job_id: Uuid,
        execution_id: Uuid,
        attempt: i32,
        status: ExecutionStatus,
        duration_ms: i64,
        error_kind: Option<ErrorKind>,
        at: DateTime<Utc>,
    },
    JobSkipped {
        task_id: Uuid,
        job_id: Uuid,
        reason: String,
        at: DateTime<Utc>,
    },
    RetryScheduled {
        task_id: Uuid,
        job_id: Uuid,
        attempt: i32,
        delay_ms: u64,
        at: DateTime<Utc>,
    },
    DeadLettered {
        task_id: Uuid,
        job_id: Uuid,
        dead_letter_id: Uuid,
        attempts: i32,
        error_kind: ErrorKind,
        at: DateTime<Utc>,
    },
    QueueDepth {
        depth: QueueDepth,
        at: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::AttemptStarted { .. } => "attempt_started",
            PipelineEvent::AttemptFinished { .. } => "attempt_finished",
            PipelineEvent::JobSkipped { .. } => "job_skipped",
            PipelineEvent::RetryScheduled { .. } => "retry_scheduled",
            PipelineEvent::DeadLettered { .. } => "dead_lettered",
            PipelineEvent::QueueDepth { .. } => "queue_depth",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

/// Writes every event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::AttemptStarted {
                task_id,
                job_id,
                attempt,
                worker_id,
                ..
            } => {
                tracing::debug!(%task_id, %job_id, attempt, %worker_id, "attempt started");
            }
            PipelineEvent::AttemptFinished {
                task_id,
                job_id,
                attempt,
                status,
                duration_ms,
                error_kind,
                ..
            } => {
                tracing::info!(
                    %task_id,
                    %job_id,
                    attempt,
                    status = status.as_str(),
                    duration_ms,
                    error_kind = error_kind.map(|k| k.as_str()),
                    "attempt finished"
                );
            }
            PipelineEvent::JobSkipped {
                task_id,
                job_id,
                reason,
                ..
            } => {
                tracing::info!(%task_id, %job_id, %reason, "job skipped");
            }
            PipelineEvent::RetryScheduled {
                task_id,
                job_id,
                attempt,
                delay_ms,
                ..
            } => {
                tracing::info!(%task_id, %job_id, attempt, delay_ms, "retry scheduled");
            }
            PipelineEvent::DeadLettered {
                task_id,
                job_id,
                dead_letter_id,
                attempts,
                error_kind,
                ..
            } => {
                tracing::warn!(
                    %task_id,
                    %job_id,
                    %dead_letter_id,
                    attempts,
                    error_kind = error_kind.as_str(),
                    "job dead-lettered"
                );
            }
            PipelineEvent::QueueDepth { depth, .. } => {
                tracing::debug!(
                    ready = depth.ready,
                    delayed = depth.delayed,
                    leased = depth.leased,
                    paused = depth.paused,
                    "queue depth"
                );
            }
        }
    }
}

/// Forwards events to a bounded channel without ever waiting.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<PipelineEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<PipelineEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &PipelineEvent) {
        if let Err(e) = self.tx.try_send(event.clone()) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "full",
                mpsc::error::TrySendError::Closed(_) => "closed",
            };
            tracing::debug!(event = event.name(), reason, "dropping pipeline event");
        }
    }
}

/// Fan-out to several sinks. An empty bus discards everything.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &PipelineEvent) {
        for sink in &self.sinks {
            if catch_unwind(AssertUnwindSafe(|| sink.emit(event))).is_err() {
                tracing::error!(event = event.name(), "event sink panicked; event dropped");
            }
        }
    }
}
