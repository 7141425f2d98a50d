//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in secrecy::SecretString to
//! prevent log leaks.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::scheduler::DEFAULT_SCORE_ALL_INTERVAL;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Fan-out interval (`PULSE_SCORE_ALL_INTERVAL_MS`).
    pub score_all_interval: Duration,
    /// Jobs a worker runs at once (`PULSE_WORKER_CONCURRENCY`).
    pub worker_concurrency: usize,
    /// Fallback poll interval (`PULSE_POLL_INTERVAL_MS`).
    pub poll_interval: Duration,
    /// Reservation lease (`PULSE_VISIBILITY_TIMEOUT_SECS`).
    pub visibility_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            score_all_interval: Duration::from_millis(parsed_var(
                "PULSE_SCORE_ALL_INTERVAL_MS",
                DEFAULT_SCORE_ALL_INTERVAL.as_millis() as u64,
            )?),
            worker_concurrency: parsed_var("PULSE_WORKER_CONCURRENCY", 4)?,
            poll_interval: Duration::from_millis(parsed_var("PULSE_POLL_INTERVAL_MS", 1_000)?),
            visibility_timeout: Duration::from_secs(parsed_var(
                "PULSE_VISIBILITY_TIMEOUT_SECS",
                60,
            )?),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Optional numeric variable. Zero is rejected: every knob here is a
/// count or an interval.
fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return Ok(default);
    };
    let value: T = raw
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name}={raw:?} is not a valid number: {e}")))?;
    if value == T::default() {
        return Err(Error::Config(format!("{name} must be greater than zero")));
    }
    Ok(value)
}
