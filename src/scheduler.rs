//! Scheduler: owns the recurring fan-out trigger and the on-demand
//! "score this user now" entry point.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::info;

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::model::job::{BackoffPolicy, JobId, JobOptions, JobPayload, RepeatRegistration};
use crate::telemetry::metrics;

/// Default fan-out interval: every 5 minutes.
pub const DEFAULT_SCORE_ALL_INTERVAL: Duration = Duration::from_millis(300_000);

const SCORE_ALL_ATTEMPTS: u32 = 3;
const SCORE_ALL_BACKOFF_BASE: Duration = Duration::from_millis(5_000);
const SCORE_USER_ATTEMPTS: u32 = 3;
const SCORE_USER_BACKOFF_BASE: Duration = Duration::from_millis(3_000);

/// Options for the repeatable fan-out job.
pub fn score_all_options() -> JobOptions {
    JobOptions::new(
        SCORE_ALL_ATTEMPTS,
        BackoffPolicy::exponential(SCORE_ALL_BACKOFF_BASE),
    )
}

/// Options for every per-user scoring job, whether fanned out or requested
/// on demand.
pub fn score_user_options() -> JobOptions {
    JobOptions::new(
        SCORE_USER_ATTEMPTS,
        BackoffPolicy::exponential(SCORE_USER_BACKOFF_BASE),
    )
}

pub struct Scheduler {
    broker: Arc<dyn Broker>,
    interval: Duration,
    closed: AtomicBool,
}

impl Scheduler {
    /// Register the repeatable fan-out job and return the running scheduler.
    ///
    /// Safe to call from any number of instances: registration is keyed by
    /// (kind, interval), so the firing rate does not multiply.
    pub async fn start(broker: Arc<dyn Broker>, interval: Duration) -> Result<Self> {
        let registration = broker
            .register_repeatable(JobPayload::ScoreAllUsers, score_all_options(), interval)
            .await?;

        let result = match registration {
            RepeatRegistration::Registered => "registered",
            RepeatRegistration::AlreadyRegistered => "already_registered",
        };
        metrics::repeatable_registrations().add(
            1,
            &[
                KeyValue::new("kind", JobPayload::ScoreAllUsers.kind().name()),
                KeyValue::new("result", result),
            ],
        );
        info!(
            interval_ms = interval.as_millis() as u64,
            result, "scoring scheduler initialized"
        );

        Ok(Self {
            broker,
            interval,
            closed: AtomicBool::new(false),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Request immediate, asynchronous scoring of one user.
    pub async fn enqueue_user_score(&self, user_id: i64) -> Result<JobId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let id = self
            .broker
            .enqueue(JobPayload::score_user(user_id), score_user_options())
            .await?;
        info!(user_id, job_id = %id, "user score requested");
        Ok(id)
    }

    /// Stop accepting requests and close this scheduler's broker handle.
    /// Jobs already enqueued stay durable.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.broker.close().await?;
        info!("scoring scheduler shut down");
        Ok(())
    }
}
