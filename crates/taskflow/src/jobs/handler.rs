use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ErrorKind, ExecutionError};
use crate::tasks::Task;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Failure returned by task logic. Carries its own kind so the retry
/// controller never has to guess from the message.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

impl HandlerError {
    /// Ordinary, retryable failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Handler,
            message: message.into(),
            detail: None,
        }
    }

    /// The payload can never be processed; dead-lettered on first occurrence.
    pub fn bad_payload(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::BadPayload,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<HandlerError> for ExecutionError {
    fn from(e: HandlerError) -> Self {
        ExecutionError {
            kind: e.kind,
            message: e.message,
            detail: e.detail,
        }
    }
}

/// Per-attempt context handed to a handler.
///
/// `cancel` fires when the attempt times out. Honouring it is optional: a
/// handler that ignores it keeps running in the background, but its result is
/// discarded.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub worker_id: String,
    pub job_id: Uuid,
    pub attempt: i32,
    pub cancel: CancellationToken,
}

/// Pluggable task logic. Delivery is at-least-once, so `execute` must tolerate
/// being called more than once with the same `(task, payload)`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(
        &self,
        task: &Task,
        payload: Value,
        ctx: HandlerContext,
    ) -> Result<Value, HandlerError>;
}

type HandlerFn =
    dyn Fn(Arc<Task>, Value, HandlerContext) -> BoxFuture<Result<Value, HandlerError>> + Send + Sync;

struct FnHandler(Arc<HandlerFn>);

#[async_trait]
impl TaskHandler for FnHandler {
    async fn execute(
        &self,
        task: &Task,
        payload: Value,
        ctx: HandlerContext,
    ) -> Result<Value, HandlerError> {
        (self.0)(Arc::new(task.clone()), payload, ctx).await
    }
}

/// Handlers keyed by task name, with an optional catch-all.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    fallback: Option<Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_name: &str, handler: impl TaskHandler + 'static) -> &mut Self {
        self.handlers.insert(task_name.to_string(), Arc::new(handler));
        self
    }

    /// Registers a closure returning a boxed future; see [`boxed`].
    pub fn register_fn<F>(&mut self, task_name: &str, f: F) -> &mut Self
    where
        F: Fn(Arc<Task>, Value, HandlerContext) -> BoxFuture<Result<Value, HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers
            .insert(task_name.to_string(), Arc::new(FnHandler(Arc::new(f))));
        self
    }

    pub fn set_fallback(&mut self, handler: impl TaskHandler + 'static) -> &mut Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    pub fn handler_for(&self, task_name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .get(task_name)
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

pub fn boxed<T>(fut: impl Future<Output = T> + Send + 'static) -> BoxFuture<T> {
    Box::pin(fut)
}

/// Decodes a payload, mapping failures to a non-retryable `BAD_PAYLOAD`.
pub fn parse_payload<T: for<'de> Deserialize<'de>>(payload: Value) -> Result<T, HandlerError> {
    serde_json::from_value(payload).map_err(|e| HandlerError::bad_payload(e.to_string()))
}
