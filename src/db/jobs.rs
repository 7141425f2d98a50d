//! Postgres-backed broker.
//!
//! Jobs live in the `jobs` table and are claimed with
//! `FOR UPDATE SKIP LOCKED`, so any number of worker processes can reserve
//! from the same queue. A reservation is a lease: an Active job whose
//! `locked_until` passes is put back to Waiting (or Failed, if it has no
//! attempts left) by the next reserve. Repeatable definitions live in
//! `repeatable_jobs`, keyed by (kind, every_ms).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::model::job::{
    BackoffPolicy, Job, JobCounts, JobId, JobOptions, JobPayload, JobStatus, RepeatRegistration,
    validate_transition,
};
use crate::telemetry::metrics;

const READY_CHANNEL: &str = "job_ready";

const JOB_COLUMNS: &str = "id, kind, payload, status, attempts, max_attempts, backoff_kind, backoff_ms, repeat_every_ms, run_at, last_error, created_at, updated_at, finished_at";

/// A broker handle over a Postgres pool.
pub struct PgBroker {
    pool: PgPool,
    visibility_timeout: Duration,
    closed: AtomicBool,
    listener: tokio::sync::Mutex<Option<PgListener>>,
}

impl PgBroker {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            closed: AtomicBool::new(false),
            listener: tokio::sync::Mutex::new(None),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Return expired leases to the queue. Jobs without attempts left go
    /// Failed instead.
    async fn recover_expired_leases(&self) -> Result<u64> {
        let recovered = sqlx::query(
            "UPDATE jobs SET
                status = CASE WHEN attempts < max_attempts THEN 'waiting' ELSE 'failed' END,
                finished_at = CASE WHEN attempts < max_attempts THEN NULL ELSE now() END,
                last_error = 'reservation lease expired',
                locked_until = NULL,
                updated_at = now()
             WHERE status = 'active' AND locked_until <= now()",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

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
        Ok(recovered)
    }

    /// Turn due repeatable definitions into waiting jobs. A definition's
    /// slot is advanced in the same statement, and locked rows are skipped,
    /// so each slot fires once across all reservers.
    async fn promote_repeatables(&self) -> Result<u64> {
        let fired: Vec<(String,)> = sqlx::query_as(
            "WITH due AS (
                UPDATE repeatable_jobs r SET next_run_at = pulse_next_slot(r.every_ms)
                FROM (
                    SELECT kind, every_ms FROM repeatable_jobs
                    WHERE next_run_at <= now()
                    FOR UPDATE SKIP LOCKED
                ) d
                WHERE r.kind = d.kind AND r.every_ms = d.every_ms
                RETURNING r.kind, r.every_ms, r.payload, r.max_attempts, r.backoff_kind, r.backoff_ms
             )
             INSERT INTO jobs (id, kind, payload, status, attempts, max_attempts, backoff_kind, backoff_ms, repeat_every_ms, run_at, created_at, updated_at)
             SELECT gen_random_uuid(), kind, payload, 'waiting', 0, max_attempts, backoff_kind, backoff_ms, every_ms, now(), now(), now()
             FROM due
             RETURNING kind",
        )
        .fetch_all(&self.pool)
        .await?;

        for (kind,) in &fired {
            debug!(kind = %kind, "repeatable fired");
            metrics::jobs_enqueued().add(
                1,
                &[
                    KeyValue::new("kind", kind.clone()),
                    KeyValue::new("source", "repeat"),
                ],
            );
        }
        Ok(fired.len() as u64)
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn enqueue_raw(
        &self,
        kind: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId> {
        self.ensure_open()?;
        let id = Uuid::new_v4();
        let (backoff_kind, backoff_ms) = options.backoff.to_parts();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO jobs (id, kind, payload, status, attempts, max_attempts, backoff_kind, backoff_ms, run_at, created_at, updated_at)
             VALUES ($1, $2, $3, 'waiting', 0, $4, $5, $6, now() + make_interval(secs => $7), now(), now())",
        )
        .bind(id)
        .bind(kind)
        .bind(&payload)
        .bind(options.max_attempts as i32)
        .bind(backoff_kind)
        .bind(backoff_ms)
        .bind(options.delay.as_secs_f64())
        .execute(&mut *tx)
        .await?;

        // NOTIFY is transactional, only fires on commit
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(READY_CHANNEL)
            .bind(kind)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        metrics::jobs_enqueued().add(
            1,
            &[
                KeyValue::new("kind", kind.to_string()),
                KeyValue::new("source", "producer"),
            ],
        );
        debug!(job_id = %id, kind, "job enqueued");
        Ok(JobId(id))
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
        let kind = payload.kind().name();
        let every_ms = every.as_millis() as i64;
        let (backoff_kind, backoff_ms) = options.backoff.to_parts();

        let inserted: Option<(String,)> = sqlx::query_as(
            "INSERT INTO repeatable_jobs (kind, every_ms, payload, max_attempts, backoff_kind, backoff_ms, next_run_at)
             VALUES ($1, $2, $3, $4, $5, $6, pulse_next_slot($2))
             ON CONFLICT (kind, every_ms) DO NOTHING
             RETURNING kind",
        )
        .bind(kind)
        .bind(every_ms)
        .bind(payload.to_json())
        .bind(options.max_attempts as i32)
        .bind(backoff_kind)
        .bind(backoff_ms)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            info!(kind, every_ms, "repeatable registered");
            Ok(RepeatRegistration::Registered)
        } else {
            debug!(kind, every_ms, "repeatable already registered");
            Ok(RepeatRegistration::AlreadyRegistered)
        }
    }

    async fn reserve(&self) -> Result<Option<Job>> {
        self.ensure_open()?;
        self.recover_expired_leases().await?;
        self.promote_repeatables().await?;

        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs SET status = 'active', attempts = attempts + 1,
                locked_until = now() + make_interval(secs => $1), updated_at = now()
             WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'waiting' AND run_at <= now()
                ORDER BY run_at, created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        metrics::job_state_transitions().add(
            1,
            &[
                KeyValue::new("from", "waiting"),
                KeyValue::new("to", "active"),
            ],
        );
        row.try_into_job().map(Some)
    }

    async fn complete(&self, id: JobId) -> Result<()> {
        let rows_affected = sqlx::query("DELETE FROM jobs WHERE id = $1 AND status = 'active'")
            .bind(id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows_affected == 0 {
            return Err(Error::InvalidTransition {
                from: "active".to_string(),
                to: "completed".to_string(),
            });
        }
        metrics::job_state_transitions().add(
            1,
            &[
                KeyValue::new("from", "active"),
                KeyValue::new("to", "completed"),
            ],
        );
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str, retryable: bool) -> Result<JobStatus> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(String, i32, i32, String, i64)> = sqlx::query_as(
            "SELECT status, attempts, max_attempts, backoff_kind, backoff_ms
             FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let (status, attempts, max_attempts, backoff_kind, backoff_ms) =
            current.ok_or_else(|| Error::NotFound(format!("job {id}")))?;

        let from: JobStatus = status.parse()?;
        let to = if retryable && attempts < max_attempts {
            JobStatus::Waiting
        } else {
            JobStatus::Failed
        };
        validate_transition(from, to)?;

        if to == JobStatus::Waiting {
            let delay = BackoffPolicy::from_parts(&backoff_kind, backoff_ms)?
                .delay_for(attempts.max(0) as u32);
            sqlx::query(
                "UPDATE jobs SET status = 'waiting', last_error = $1, locked_until = NULL,
                    run_at = now() + make_interval(secs => $2), updated_at = now()
                 WHERE id = $3",
            )
            .bind(error)
            .bind(delay.as_secs_f64())
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE jobs SET status = 'failed', last_error = $1, locked_until = NULL,
                    updated_at = now(), finished_at = now()
                 WHERE id = $2",
            )
            .bind(error)
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        metrics::job_state_transitions().add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
        Ok(to)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(JobRow::try_into_job).transpose()
    }

    async fn failed_jobs(&self) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'failed' ORDER BY finished_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    async fn counts(&self) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut counts = JobCounts::default();
        for (status, n) in rows {
            let n = n.max(0) as u64;
            match status.parse()? {
                JobStatus::Waiting => counts.waiting = n,
                JobStatus::Active => counts.active = n,
                JobStatus::Failed => counts.failed = n,
                JobStatus::Completed => {}
            }
        }
        Ok(counts)
    }

    async fn wait_ready(&self, max_wait: Duration) {
        let mut guard = self.listener.lock().await;
        if guard.is_none() {
            match PgListener::connect_with(&self.pool).await {
                Ok(mut listener) => match listener.listen(READY_CHANNEL).await {
                    Ok(()) => *guard = Some(listener),
                    Err(e) => warn!("LISTEN failed: {e}, falling back to poll"),
                },
                Err(e) => warn!("PgListener connect failed: {e}, falling back to poll"),
            }
        }

        match guard.as_mut() {
            Some(listener) => match tokio::time::timeout(max_wait, listener.recv()).await {
                Ok(Ok(notification)) => {
                    debug!(kind = notification.payload(), "notified of new job");
                }
                Ok(Err(e)) => {
                    warn!("PgListener error: {e}, reconnecting on next wait");
                    *guard = None;
                }
                Err(_) => {}
            },
            None => tokio::time::sleep(max_wait).await,
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.listener.lock().await.take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    kind: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    backoff_kind: String,
    backoff_ms: i64,
    repeat_every_ms: Option<i64>,
    run_at: chrono::DateTime<chrono::Utc>,
    last_error: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            kind: self.kind,
            payload: self.payload,
            status: self.status.parse()?,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
            backoff: BackoffPolicy::from_parts(&self.backoff_kind, self.backoff_ms)?,
            repeat_every_ms: self.repeat_every_ms.map(|ms| ms.max(0) as u64),
            run_at: self.run_at,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        })
    }
}
