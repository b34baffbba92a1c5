//! Task scheduling and execution pipeline.
//!
//! Tasks are admitted through [`tasks::TaskScheduler`], turned into jobs on a
//! [`queue::DispatchQueue`], leased and executed by a [`jobs::WorkerPool`],
//! audited in the [`ledger`], retried with exponential backoff and finally
//! quarantined in the [`dead_letter`] store.

pub mod api;
pub mod config;
pub mod db;
pub mod dead_letter;
pub mod error;
pub mod events;
pub mod jobs;
pub mod ledger;
pub mod queue;
pub mod schedule;
pub mod stats;
pub mod tasks;
pub mod telemetry;

pub use error::{Error, ErrorKind, ExecutionError, Result};
