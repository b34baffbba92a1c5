//! Cron expression evaluation in UTC, backed by `croner`.
//!
//! Accepts the five-field form (`minute hour day-of-month month day-of-week`)
//! and the six-field form with a leading seconds field, with steps, ranges,
//! lists, month/weekday names and the `@hourly`-style macros. When both day
//! fields are restricted a day matches if either does.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use croner::Cron;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("empty cron expression")]
    Empty,

    #[error("invalid cron expression `{expression}`: {reason}")]
    Invalid { expression: String, reason: String },

    #[error("`{expression}` has no next occurrence: {reason}")]
    NoOccurrence { expression: String, reason: String },
}

/// A parsed, validated cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    cron: Cron,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(CronError::Empty);
        }

        let cron = Cron::new(trimmed)
            .with_seconds_optional()
            .parse()
            .map_err(|e| CronError::Invalid {
                expression: trimmed.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expression: trimmed.to_string(),
            cron,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next fire time strictly after `after`, at whole-second resolution.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        self.cron
            .find_next_occurrence(&after, false)
            .map_err(|e| CronError::NoOccurrence {
                expression: self.expression.clone(),
                reason: e.to_string(),
            })
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for CronSchedule {}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Parse `expression` and return its next fire time strictly after `after`.
pub fn next_fire_time(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    CronSchedule::parse(expression)?.next_after(after)
}
