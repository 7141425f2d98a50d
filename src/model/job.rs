//! Jobs: identity, typed payloads, lifecycle status, retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Kind + payload
// ---------------------------------------------------------------------------

/// The closed set of job kinds the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    ScoreAllUsers,
    ScoreUser,
}

impl JobKind {
    /// Stable wire name.
    pub fn name(self) -> &'static str {
        match self {
            JobKind::ScoreAllUsers => "score-all-users",
            JobKind::ScoreUser => "score-user",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "score-all-users" => Ok(JobKind::ScoreAllUsers),
            "score-user" => Ok(JobKind::ScoreUser),
            other => Err(Error::Validation(format!("unknown job kind: {other}"))),
        }
    }
}

/// Strongly typed job payload. Jobs travel through the broker in wire form
/// (kind name + JSON); [`JobPayload::decode`] is the only way back in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    ScoreAllUsers,
    ScoreUser { user_id: i64 },
}

#[derive(Serialize, Deserialize)]
struct ScoreUserWire {
    #[serde(rename = "userId")]
    user_id: i64,
}

impl JobPayload {
    pub fn score_user(user_id: i64) -> Self {
        JobPayload::ScoreUser { user_id }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::ScoreAllUsers => JobKind::ScoreAllUsers,
            JobPayload::ScoreUser { .. } => JobKind::ScoreUser,
        }
    }

    /// Wire form of the payload body.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            JobPayload::ScoreAllUsers => serde_json::json!({}),
            JobPayload::ScoreUser { user_id } => serde_json::json!({ "userId": user_id }),
        }
    }

    /// Decode a wire-form job. Unknown kinds and malformed bodies are
    /// validation errors.
    pub fn decode(kind: &str, payload: &serde_json::Value) -> Result<Self> {
        match kind.parse::<JobKind>()? {
            JobKind::ScoreAllUsers => match payload {
                serde_json::Value::Null | serde_json::Value::Object(_) => {
                    Ok(JobPayload::ScoreAllUsers)
                }
                other => Err(Error::Validation(format!(
                    "score-all-users expects an empty object, got {other}"
                ))),
            },
            JobKind::ScoreUser => {
                let wire: ScoreUserWire = serde_json::from_value(payload.clone())
                    .map_err(|e| Error::Validation(format!("score-user payload: {e}")))?;
                Ok(JobPayload::ScoreUser {
                    user_id: wire.user_id,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Ready (or delayed until `run_at`), waiting for a consumer.
    Waiting,
    /// Reserved by a consumer, handler running.
    Active,
    /// Handler succeeded. Completed jobs are purged from the broker.
    Completed,
    /// Attempts exhausted or payload invalid. Retained. Terminal.
    Failed,
}

impl JobStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Waiting, Active)
                | (Active, Completed)
                | (Active, Waiting)     // retry, or expired lease
                | (Active, Failed)
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Other(format!("unknown job status: {other}"))),
        }
    }
}

/// Validate a status transition, returning an error if disallowed.
pub(crate) fn validate_transition(from: JobStatus, to: JobStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Delay between a failed attempt and the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },
    /// `base * 2^(attempts - 1)`: base, 2·base, 4·base, …
    Exponential { base_ms: u64 },
}

impl BackoffPolicy {
    pub fn exponential(base: Duration) -> Self {
        BackoffPolicy::Exponential {
            base_ms: base.as_millis() as u64,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        BackoffPolicy::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Delay after `attempts` attempts have been made (the failed one
    /// included). `attempts` is at least 1 whenever a retry is scheduled.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential { base_ms } => {
                let shift = attempts.saturating_sub(1).min(32);
                Duration::from_millis(base_ms.saturating_mul(1u64 << shift))
            }
        }
    }

    /// Storage discriminator and base delay, for table-backed brokers.
    pub(crate) fn to_parts(self) -> (&'static str, i64) {
        match self {
            BackoffPolicy::Fixed { delay_ms } => ("fixed", delay_ms as i64),
            BackoffPolicy::Exponential { base_ms } => ("exponential", base_ms as i64),
        }
    }

    pub(crate) fn from_parts(kind: &str, ms: i64) -> Result<Self> {
        let ms = ms.max(0) as u64;
        match kind {
            "fixed" => Ok(BackoffPolicy::Fixed { delay_ms: ms }),
            "exponential" => Ok(BackoffPolicy::Exponential { base_ms: ms }),
            other => Err(Error::Other(format!("unknown backoff policy: {other}"))),
        }
    }
}

/// Per-job delivery options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Total attempts before the job goes Failed (1 = no retry).
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Delay before the first attempt.
    pub delay: Duration,
}

impl JobOptions {
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            delay: Duration::ZERO,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A job as stored by the broker. Payload stays in wire form until a
/// handler decodes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Wire name of the kind (see [`JobKind::name`]).
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Attempts made so far (incremented on each reservation).
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Interval of the repeatable definition that produced this job, if any.
    pub repeat_every_ms: Option<u64>,
    /// Earliest time the job may be (re)delivered.
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn decode(&self) -> Result<JobPayload> {
        JobPayload::decode(&self.kind, &self.payload)
    }

    /// Whether another attempt is allowed after the current one fails.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Outcome of registering a repeatable definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatRegistration {
    Registered,
    /// The (kind, interval) key already existed; nothing changed.
    AlreadyRegistered,
}

/// Per-status job counts, for diagnosis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub failed: u64,
}
