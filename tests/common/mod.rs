//! Shared fixtures: an in-memory pipeline on a simulated clock.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_rs::broker::{
    Broker, Consumer, ConsumerConfig, JobObserver, MemoryBackend, MemoryBroker,
};
use pulse_rs::clock::{Clock, SimulatedClock};
use pulse_rs::error::{Error, Result};
use pulse_rs::model::activity::SignalCounts;
use pulse_rs::model::job::{Job, JobStatus};
use pulse_rs::scoring::ScoringEngine;
use pulse_rs::store::{ActivitySource, MemoryStore};
use pulse_rs::worker::Worker;

/// Activity source that is unreachable for one user and delegates the rest.
pub struct UnreachableFor {
    pub inner: Arc<MemoryStore>,
    pub user_id: i64,
    pub calls: AtomicU32,
}

impl UnreachableFor {
    pub fn new(inner: Arc<MemoryStore>, user_id: i64) -> Self {
        Self {
            inner,
            user_id,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ActivitySource for UnreachableFor {
    async fn signal_counts(&self, user_id: i64, since: DateTime<Utc>) -> Result<SignalCounts> {
        if user_id == self.user_id {
            self.calls.fetch_add(1, Ordering::SeqCst);
            return Err(Error::Other("activity store unreachable".to_string()));
        }
        self.inner.signal_counts(user_id, since).await
    }

    async fn has_active_session(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool> {
        self.inner.has_active_session(user_id, now).await
    }
}

/// Observer that records every outcome it sees.
#[derive(Default)]
pub struct RecordingObserver {
    pub completed: Mutex<Vec<Job>>,
    pub failed: Mutex<Vec<(Job, JobStatus)>>,
    pub calls: AtomicUsize,
}

impl RecordingObserver {
    pub fn completed_of_kind(&self, kind: &str) -> usize {
        self.completed
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.kind == kind)
            .count()
    }
}

impl JobObserver for RecordingObserver {
    fn on_completed(&self, job: &Job, _result: &serde_json::Value) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.completed.lock().unwrap().push(job.clone());
        Ok(())
    }

    fn on_failed(&self, job: &Job, _error: &Error, status: JobStatus) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.failed.lock().unwrap().push((job.clone(), status));
        Ok(())
    }
}

pub struct Pipeline {
    pub clock: Arc<SimulatedClock>,
    pub backend: MemoryBackend,
    pub store: Arc<MemoryStore>,
    pub broker: Arc<MemoryBroker>,
    pub worker: Arc<Worker>,
    pub observer: Arc<RecordingObserver>,
    pub consumer: Consumer,
}

impl Pipeline {
    /// Pipeline whose activity reads go straight to the memory store.
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_activity(store.clone(), store)
    }

    pub fn with_activity(store: Arc<MemoryStore>, activity: Arc<dyn ActivitySource>) -> Self {
        let clock = Arc::new(SimulatedClock::deterministic());
        let backend = MemoryBackend::new(clock.clone());
        Self::on_backend(clock, backend, store, activity)
    }

    pub fn on_backend(
        clock: Arc<SimulatedClock>,
        backend: MemoryBackend,
        store: Arc<MemoryStore>,
        activity: Arc<dyn ActivitySource>,
    ) -> Self {
        let broker = Arc::new(backend.connect());
        let engine = Arc::new(ScoringEngine::with_clock(
            activity,
            store.clone(),
            clock.clone(),
        ));
        let worker = Arc::new(Worker::new(broker.clone(), store.clone(), engine));
        let observer = Arc::new(RecordingObserver::default());
        let consumer = worker
            .consumer(ConsumerConfig::default())
            .with_observer(observer.clone());
        Self {
            clock,
            backend,
            store,
            broker,
            worker,
            observer,
            consumer,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    pub async fn add_users(&self, ids: impl IntoIterator<Item = i64>) {
        for id in ids {
            self.store.add_user(id).await;
        }
    }
}
