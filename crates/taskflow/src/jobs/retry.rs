use rand::Rng;
use std::time::Duration;

use crate::error::ExecutionError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Fraction of the delay added or removed at random. 0 gives exact
    /// `base * 2^(attempt-1)` delays.
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 15 * 60 * 1_000,
            jitter_pct: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    NonRetryable,
    RetriesExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::NonRetryable => "NON_RETRYABLE",
            DeadLetterReason::RetriesExhausted => "MAX_ATTEMPTS_EXCEEDED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    DeadLetter { reason: DeadLetterReason },
}

/// Delay before the attempt after `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at `max_ms`, then jittered.
pub fn next_delay(attempt: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> Duration {
    let exp = (attempt.max(1) as u32).saturating_sub(1);

    // 2^exp; past 63 the cap takes over anyway
    let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);
    let delay = cfg.base_ms.saturating_mul(pow2).min(cfg.max_ms);

    if cfg.jitter_pct <= 0.0 || delay == 0 {
        return Duration::from_millis(delay);
    }

    let jitter_range = delay as f64 * cfg.jitter_pct;
    let jitter = rng.gen_range(-jitter_range..=jitter_range);
    let jittered = (delay as f64 + jitter).round().max(0.0) as u64;
    Duration::from_millis(jittered.min(cfg.max_ms))
}

/// Retry while attempts remain and the failure class allows it.
pub fn decide(
    error: &ExecutionError,
    attempt: i32,
    attempts_allowed: i32,
    cfg: &RetryConfig,
    rng: &mut impl Rng,
) -> RetryDecision {
    if !error.is_retryable() {
        return RetryDecision::DeadLetter {
            reason: DeadLetterReason::NonRetryable,
        };
    }
    if attempt >= attempts_allowed {
        return RetryDecision::DeadLetter {
            reason: DeadLetterReason::RetriesExhausted,
        };
    }
    RetryDecision::Retry {
        delay: next_delay(attempt, cfg, rng),
    }
}
