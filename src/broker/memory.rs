//! In-process broker backend.
//!
//! [`MemoryBackend`] plays the role of the durable queue server and
//! [`MemoryBroker`] the role of a client connection to it: any number of
//! handles can be connected, and closing one leaves the backend's jobs and
//! the other handles alone. Time comes from an injected [`Clock`].
//!
//! A reservation is a lease: an Active job not completed or failed within
//! the visibility timeout goes back to Waiting on the next reserve (or to
//! Failed, if it has no attempts left), whichever handle reserves.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::Broker;
use crate::clock::{Clock, SystemClock, next_aligned_slot};
use crate::error::{Error, Result};
use crate::model::job::{
    Job, JobCounts, JobId, JobOptions, JobPayload, JobStatus, RepeatRegistration,
    validate_transition,
};
use crate::telemetry::metrics;

/// Lease on a reserved job unless overridden.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

const LEASE_EXPIRED: &str = "reservation lease expired";

struct Entry {
    seq: u64,
    job: Job,
    locked_until: Option<chrono::DateTime<chrono::Utc>>,
}

struct RepeatDef {
    kind: String,
    payload: serde_json::Value,
    options: JobOptions,
    every: Duration,
    next_run_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    jobs: HashMap<JobId, Entry>,
    repeatables: HashMap<(String, u64), RepeatDef>,
}

impl State {
    fn insert(&mut self, job: Job) -> JobId {
        let id = job.id;
        self.next_seq += 1;
        let seq = self.next_seq;
        self.jobs.insert(
            id,
            Entry {
                seq,
                job,
                locked_until: None,
            },
        );
        id
    }

    /// Return Active jobs whose lease ran out to the queue.
    fn recover_expired_leases(&mut self, now: chrono::DateTime<chrono::Utc>) -> u64 {
        let mut recovered = 0;
        for entry in self.jobs.values_mut() {
            let expired = entry.job.status == JobStatus::Active
                && entry.locked_until.is_some_and(|until| until <= now);
            if !expired {
                continue;
            }
            let job = &mut entry.job;
            if job.has_attempts_left() {
                job.status = JobStatus::Waiting;
                job.run_at = now;
            } else {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
            }
            job.last_error = Some(LEASE_EXPIRED.to_string());
            job.updated_at = now;
            entry.locked_until = None;
            recovered += 1;
        }
        recovered
    }
}

/// Shared in-process queue state.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    ready: Arc<Notify>,
    visibility_timeout: Duration,
}

impl MemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
            ready: Arc::new(Notify::new()),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    /// How long a reservation is held before the job is redelivered.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Open a new handle onto this backend.
    pub fn connect(&self) -> MemoryBroker {
        MemoryBroker {
            backend: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of registered repeatable definitions.
    pub async fn repeatable_count(&self) -> usize {
        self.state.lock().await.repeatables.len()
    }

    /// All jobs currently held (waiting, active, failed), in insertion order.
    pub async fn jobs(&self) -> Vec<Job> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state.jobs.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.job.clone()).collect()
    }
}

/// A handle onto a [`MemoryBackend`].
pub struct MemoryBroker {
    backend: MemoryBackend,
    closed: AtomicBool,
}

impl MemoryBroker {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue_raw(
        &self,
        kind: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId> {
        self.ensure_open()?;
        let now = self.backend.clock.now();
        let job = Job {
            id: JobId::new(),
            kind: kind.to_string(),
            payload,
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: options.max_attempts,
            backoff: options.backoff,
            repeat_every_ms: None,
            run_at: now + chrono::Duration::milliseconds(options.delay.as_millis() as i64),
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        let id = self.backend.state.lock().await.insert(job);
        metrics::jobs_enqueued().add(
            1,
            &[
                KeyValue::new("kind", kind.to_string()),
                KeyValue::new("source", "producer"),
            ],
        );
        debug!(job_id = %id, kind, "job enqueued");
        self.backend.ready.notify_waiters();
        Ok(id)
    }

    async fn register_repeatable(
        &self,
        payload: JobPayload,
        options: JobOptions,
        every: Duration,
    ) -> Result<RepeatRegistration> {
        self.ensure_open()?;
        if every.as_millis() == 0 {
            return Err(Error::Validation(
                "repeat interval must be at least one millisecond".to_string(),
            ));
        }
        let kind = payload.kind().name().to_string();
        let key = (kind.clone(), every.as_millis() as u64);
        let now = self.backend.clock.now();

        let mut state = self.backend.state.lock().await;
        if state.repeatables.contains_key(&key) {
            debug!(kind = %kind, every_ms = key.1, "repeatable already registered");
            return Ok(RepeatRegistration::AlreadyRegistered);
        }
        let next_run_at = next_aligned_slot(now, every);
        state.repeatables.insert(
            key,
            RepeatDef {
                kind: kind.clone(),
                payload: payload.to_json(),
                options,
                every,
                next_run_at,
            },
        );
        info!(kind = %kind, every_ms = every.as_millis() as u64, %next_run_at, "repeatable registered");
        Ok(RepeatRegistration::Registered)
    }

    async fn reserve(&self) -> Result<Option<Job>> {
        self.ensure_open()?;
        let now = self.backend.clock.now();
        let mut state = self.backend.state.lock().await;

        let recovered = state.recover_expired_leases(now);
        if recovered > 0 {
            warn!(recovered, "expired job leases recovered");
            metrics::job_state_transitions().add(
                recovered,
                &[
                    KeyValue::new("from", "active"),
                    KeyValue::new("to", "recovered"),
                ],
            );
        }

        // Promote due repeatables: one job per definition per due slot.
        let mut fired = Vec::new();
        for def in state.repeatables.values_mut() {
            if def.next_run_at <= now {
                fired.push(Job {
                    id: JobId::new(),
                    kind: def.kind.clone(),
                    payload: def.payload.clone(),
                    status: JobStatus::Waiting,
                    attempts: 0,
                    max_attempts: def.options.max_attempts,
                    backoff: def.options.backoff,
                    repeat_every_ms: Some(def.every.as_millis() as u64),
                    run_at: def.next_run_at,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                    finished_at: None,
                });
                def.next_run_at = next_aligned_slot(now, def.every);
            }
        }
        for job in fired {
            debug!(kind = %job.kind, job_id = %job.id, "repeatable fired");
            metrics::jobs_enqueued().add(
                1,
                &[
                    KeyValue::new("kind", job.kind.clone()),
                    KeyValue::new("source", "repeat"),
                ],
            );
            state.insert(job);
        }

        let next = state
            .jobs
            .values()
            .filter(|e| e.job.status == JobStatus::Waiting && e.job.run_at <= now)
            .min_by_key(|e| (e.job.run_at, e.seq))
            .map(|e| e.job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        validate_transition(entry.job.status, JobStatus::Active)?;
        entry.job.status = JobStatus::Active;
        entry.job.attempts += 1;
        entry.job.updated_at = now;
        entry.locked_until = Some(
            now + chrono::Duration::milliseconds(
                self.backend.visibility_timeout.as_millis() as i64,
            ),
        );
        Ok(Some(entry.job.clone()))
    }

    async fn complete(&self, id: JobId) -> Result<()> {
        let mut state = self.backend.state.lock().await;
        let entry = state
            .jobs
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        validate_transition(entry.job.status, JobStatus::Completed)?;
        state.jobs.remove(&id);
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str, retryable: bool) -> Result<JobStatus> {
        let now = self.backend.clock.now();
        let mut state = self.backend.state.lock().await;
        let entry = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        let to = if retryable && entry.job.has_attempts_left() {
            JobStatus::Waiting
        } else {
            JobStatus::Failed
        };
        validate_transition(entry.job.status, to)?;
        entry.locked_until = None;

        let job = &mut entry.job;
        job.status = to;
        job.last_error = Some(error.to_string());
        job.updated_at = now;
        if to == JobStatus::Waiting {
            let delay = job.backoff.delay_for(job.attempts);
            job.run_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
        } else {
            job.finished_at = Some(now);
        }
        Ok(to)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let state = self.backend.state.lock().await;
        Ok(state.jobs.get(&id).map(|e| e.job.clone()))
    }

    async fn failed_jobs(&self) -> Result<Vec<Job>> {
        let state = self.backend.state.lock().await;
        let mut failed: Vec<_> = state
            .jobs
            .values()
            .filter(|e| e.job.status == JobStatus::Failed)
            .collect();
        failed.sort_by_key(|e| e.seq);
        Ok(failed.into_iter().map(|e| e.job.clone()).collect())
    }

    async fn counts(&self) -> Result<JobCounts> {
        let state = self.backend.state.lock().await;
        let mut counts = JobCounts::default();
        for entry in state.jobs.values() {
            match entry.job.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Completed => {}
            }
        }
        Ok(counts)
    }

    async fn wait_ready(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.backend.ready.notified()).await;
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
