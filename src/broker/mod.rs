//! Job broker: durable, at-least-once delivery with retry/backoff and
//! idempotent repeatable triggers.
//!
//! A [`Broker`] value is a *handle*. Closing a handle stops it from producing
//! or consuming; it never touches jobs that are already durable. Two backends
//! ship with the crate: [`memory::MemoryBackend`] (in-process) and
//! [`crate::db::PgBroker`] (Postgres).

pub mod consumer;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::job::{
    Job, JobCounts, JobId, JobOptions, JobPayload, JobStatus, RepeatRegistration,
};

pub use consumer::{Consumer, ConsumerConfig, LoggingObserver};
pub use memory::{MemoryBackend, MemoryBroker};

#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a job in wire form. External producers that only know the
    /// stable kind names go through here.
    async fn enqueue_raw(
        &self,
        kind: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId>;

    /// Enqueue a typed job.
    async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<JobId> {
        self.enqueue_raw(payload.kind().name(), payload.to_json(), options)
            .await
    }

    /// Register a repeatable definition keyed by (kind, every). Registering
    /// an existing key changes nothing.
    async fn register_repeatable(
        &self,
        payload: JobPayload,
        options: JobOptions,
        every: Duration,
    ) -> Result<RepeatRegistration>;

    /// Promote due repeatable definitions, then claim the earliest due
    /// waiting job (Waiting → Active, attempts + 1).
    async fn reserve(&self) -> Result<Option<Job>>;

    /// Active → Completed. The job is purged.
    async fn complete(&self, id: JobId) -> Result<()>;

    /// Record a failed attempt. Returns the resulting status: Waiting (retry
    /// scheduled after backoff) or Failed (retained).
    async fn fail(&self, id: JobId, error: &str, retryable: bool) -> Result<JobStatus>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Jobs in terminal Failed status, oldest first.
    async fn failed_jobs(&self) -> Result<Vec<Job>>;

    async fn counts(&self) -> Result<JobCounts>;

    /// Block until new work may be available or `max_wait` elapses.
    async fn wait_ready(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }

    /// Close this handle. Durable jobs are left untouched.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Something that executes delivered jobs. The returned JSON is passed to
/// observers on success.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<serde_json::Value>;
}

/// Observation hook for job outcomes (logging, metrics).
///
/// Called after the broker has recorded the transition. Errors and panics
/// raised here are logged and discarded.
pub trait JobObserver: Send + Sync {
    fn on_completed(&self, _job: &Job, _result: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// `status` is where the job ended up: Waiting (will retry) or Failed.
    fn on_failed(&self, _job: &Job, _error: &Error, _status: JobStatus) -> Result<()> {
        Ok(())
    }
}
