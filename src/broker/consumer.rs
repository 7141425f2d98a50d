//! Consumer: reserves jobs from a broker handle, runs them through a
//! handler, and records the outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, warn};

use super::{Broker, JobHandler, JobObserver};
use crate::error::{Error, Result};
use crate::model::job::{Job, JobStatus};
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

/// Configuration for a consumer loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum jobs executing at once.
    pub concurrency: usize,
    /// Poll interval fallback when the broker gives no readiness signal.
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Binds one handler to one broker handle.
pub struct Consumer {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn JobHandler>,
    observers: Vec<Arc<dyn JobObserver>>,
    config: ConsumerConfig,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
}

impl Clone for Consumer {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            handler: Arc::clone(&self.handler),
            observers: self.observers.clone(),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            stopping: Arc::clone(&self.stopping),
        }
    }
}

impl Consumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        handler: Arc<dyn JobHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            handler,
            observers: Vec::new(),
            config,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach an observation hook.
    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Signal the loop to stop. In-flight jobs are allowed to finish.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }

    /// Run the consume loop until shutdown or until the broker handle closes.
    pub async fn run(&self) -> Result<()> {
        let concurrency = self.config.concurrency.max(1);
        let mut in_flight = JoinSet::new();

        info!(concurrency, "consumer started");

        while !self.stopping.load(Ordering::Acquire) {
            // Fill free slots with due jobs
            while in_flight.len() < concurrency {
                match self.broker.reserve().await {
                    Ok(Some(job)) => {
                        let this = self.clone();
                        in_flight.spawn(async move { this.execute(job).await });
                    }
                    Ok(None) => break,
                    Err(Error::Closed) => {
                        info!("broker handle closed, consumer stopping");
                        self.stopping.store(true, Ordering::Release);
                        break;
                    }
                    Err(e) => {
                        error!("reserve error: {e}");
                        break;
                    }
                }
            }
            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("consumer shutting down");
                    break;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("job task aborted: {e}");
                    }
                }
                _ = self.broker.wait_ready(self.config.poll_interval), if in_flight.len() < concurrency => {}
            }
        }

        // Let in-flight jobs record their outcome
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("job task aborted: {e}");
            }
        }
        info!("consumer stopped");
        Ok(())
    }

    /// Reserve and execute a single job, if one is due.
    pub async fn poll_once(&self) -> Result<bool> {
        match self.broker.reserve().await? {
            Some(job) => {
                self.execute(job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Execute every job that is due right now, one after another.
    /// Returns the number of jobs executed.
    pub async fn drain(&self) -> Result<usize> {
        let mut executed = 0;
        while self.poll_once().await? {
            executed += 1;
        }
        Ok(executed)
    }

    /// Run one reserved job through the handler and record the outcome.
    async fn execute(&self, job: Job) {
        let job_span = start_job_span(&job.kind, &job.id.0, job.attempts);

        async {
            record_state_transition(&job_span, "waiting", "active");
            let start = Instant::now();

            // Handler runs in its own task so a panic becomes a failed attempt.
            let handler = Arc::clone(&self.handler);
            let delivered = job.clone();
            let result = match tokio::spawn(async move { handler.handle(&delivered).await }).await
            {
                Ok(result) => result,
                Err(e) => Err(Error::Other(format!("handler panicked: {e}"))),
            };
            let duration_ms = start.elapsed().as_millis() as u64;
            metrics::operation_duration_ms().record(
                duration_ms as f64,
                &[
                    KeyValue::new("operation", "job.execute"),
                    KeyValue::new("kind", job.kind.clone()),
                ],
            );

            match result {
                Ok(value) => match self.broker.complete(job.id).await {
                    Ok(()) => {
                        record_state_transition(&job_span, "active", "completed");
                        self.notify_completed(&job, &value);
                    }
                    // The reservation lease will expire and the job is redelivered.
                    Err(e) => error!(job_id = %job.id, "failed to record completion: {e}"),
                },
                Err(err) => {
                    let retryable = err.is_retryable();
                    match self.broker.fail(job.id, &err.to_string(), retryable).await {
                        Ok(status) => {
                            record_state_transition(&job_span, "active", &status.to_string());
                            self.notify_failed(&job, &err, status);
                        }
                        Err(e) => error!(job_id = %job.id, "failed to record failure: {e}"),
                    }
                }
            }
        }
        .instrument(job_span.clone())
        .await
    }

    fn notify_completed(&self, job: &Job, value: &serde_json::Value) {
        for observer in &self.observers {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_completed(job, value)));
            report_observer_outcome(job, outcome);
        }
    }

    fn notify_failed(&self, job: &Job, err: &Error, status: JobStatus) {
        for observer in &self.observers {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_failed(job, err, status)));
            report_observer_outcome(job, outcome);
        }
    }
}

fn report_observer_outcome(job: &Job, outcome: std::thread::Result<Result<()>>) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(job_id = %job.id, "observer error ignored: {e}"),
        Err(_) => warn!(job_id = %job.id, "observer panicked, ignored"),
    }
}

/// Default observer: structured logs plus outcome counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl JobObserver for LoggingObserver {
    fn on_completed(&self, job: &Job, result: &serde_json::Value) -> Result<()> {
        info!(job_id = %job.id, kind = %job.kind, attempt = job.attempts, %result, "job completed");
        metrics::job_outcomes().add(
            1,
            &[
                KeyValue::new("kind", job.kind.clone()),
                KeyValue::new("outcome", "completed"),
            ],
        );
        Ok(())
    }

    fn on_failed(&self, job: &Job, error: &Error, status: JobStatus) -> Result<()> {
        let outcome = if status == JobStatus::Failed {
            error!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                %error,
                "job failed permanently"
            );
            "failed"
        } else {
            warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                %error,
                "job attempt failed, retry scheduled"
            );
            "retrying"
        };
        metrics::job_outcomes().add(
            1,
            &[
                KeyValue::new("kind", job.kind.clone()),
                KeyValue::new("outcome", outcome),
            ],
        );
        Ok(())
    }
}
