use std::time::Duration;

use crate::jobs::{PoolConfig, RetryConfig};
use crate::telemetry::{LogConfig, LogFormat};

/// Runtime configuration, loaded from the environment (and `.env`).
///
/// Every `TASKFLOW_*` variable falls back to its un-prefixed name.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,

    pub concurrency: usize,
    pub visibility_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub reap_interval_ms: u64,
    pub shutdown_grace_ms: u64,

    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter_pct: f64,

    pub rate_limit_window_ms: u64,
    pub throttle_delay_ms: u64,

    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env_or_fallback("TASKFLOW_DATABASE_URL", "DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("TASKFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let concurrency = env_parse("TASKFLOW_CONCURRENCY", "WORKER_CONCURRENCY")
            .unwrap_or(10_usize)
            .max(1);

        let log_format = match env_or_fallback("TASKFLOW_LOG_FORMAT", "LOG_FORMAT") {
            Some(v) => v
                .parse()
                .map_err(|e: String| anyhow::anyhow!("TASKFLOW_LOG_FORMAT: {e}"))?,
            None => LogFormat::default(),
        };

        let retry_jitter_pct = env_parse("TASKFLOW_RETRY_JITTER_PCT", "RETRY_JITTER_PCT")
            .unwrap_or(0.0_f64)
            .clamp(0.0, 1.0);

        Ok(Self {
            database_url,
            worker_id,
            concurrency,
            visibility_timeout_ms: env_parse("TASKFLOW_VISIBILITY_TIMEOUT_MS", "VISIBILITY_TIMEOUT_MS")
                .unwrap_or(30_000),
            poll_interval_ms: env_parse("TASKFLOW_POLL_INTERVAL_MS", "POLL_INTERVAL_MS")
                .unwrap_or(250),
            reap_interval_ms: env_parse("TASKFLOW_REAP_INTERVAL_MS", "REAP_INTERVAL_MS")
                .unwrap_or(1_000),
            shutdown_grace_ms: env_parse("TASKFLOW_SHUTDOWN_GRACE_MS", "SHUTDOWN_GRACE_MS")
                .unwrap_or(30_000),
            retry_base_ms: env_parse("TASKFLOW_RETRY_BASE_MS", "RETRY_BASE_MS").unwrap_or(1_000),
            retry_max_ms: env_parse("TASKFLOW_RETRY_MAX_MS", "RETRY_MAX_MS")
                .unwrap_or(15 * 60 * 1_000),
            retry_jitter_pct,
            rate_limit_window_ms: env_parse("TASKFLOW_RATE_LIMIT_WINDOW_MS", "RATE_LIMIT_WINDOW_MS")
                .unwrap_or(1_000),
            throttle_delay_ms: env_parse("TASKFLOW_THROTTLE_DELAY_MS", "THROTTLE_DELAY_MS")
                .unwrap_or(250),
            admin_addr: env_or_fallback("TASKFLOW_ADMIN_ADDR", "ADMIN_ADDR")
                .and_then(|s| normalize_optional_addr(&s)),
            migrate_on_startup: env_bool("TASKFLOW_MIGRATE_ON_STARTUP").unwrap_or(false),
            log_format,
        })
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            worker_id: self.worker_id.clone(),
            concurrency: self.concurrency,
            visibility_timeout: Duration::from_millis(self.visibility_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reap_interval: Duration::from_millis(self.reap_interval_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            ..PoolConfig::default()
        }
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            base_ms: self.retry_base_ms,
            max_ms: self.retry_max_ms.max(self.retry_base_ms),
            jitter_pct: self.retry_jitter_pct,
        }
    }

    pub fn log(&self) -> LogConfig {
        LogConfig {
            format: self.log_format,
            default_directive: "info".to_string(),
        }
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms)
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(primary: &str, fallback: &str) -> Option<T> {
    env_or_fallback(primary, fallback).and_then(|s| s.trim().parse().ok())
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
