pub mod handler;
pub mod pool;
pub mod rate_limit;
pub mod retry;
pub mod runner;
pub mod timeline;

pub use handler::{
    boxed, parse_payload, BoxFuture, HandlerContext, HandlerError, HandlerRegistry, TaskHandler,
};
pub use pool::{PoolConfig, PoolHandle, WorkerPool};
pub use rate_limit::RateLimiter;
pub use retry::{DeadLetterReason, RetryConfig, RetryDecision};
pub use runner::{JobRunner, RunOutcome};
pub use timeline::{build_timeline, JobTimeline};
