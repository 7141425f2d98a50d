//! Collaborator seams.
//!
//! The scoring pipeline reads users, activity signals and work sessions that
//! other systems own, and appends score records that other systems read.
//! Each interface is a trait; [`crate::db::Db`] implements all of them over
//! Postgres and [`memory::MemoryStore`] in process.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::activity::SignalCounts;
use crate::model::score::{NewScoreRecord, ScoreRecord};

pub use memory::MemoryStore;

/// Read-only enumeration of user ids.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_ids(&self) -> Result<Vec<i64>>;
}

/// Read-only aggregate queries over activity signals and work sessions.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// Signal counts grouped by type for `user_id`, created at or after
    /// `since`.
    async fn signal_counts(&self, user_id: i64, since: DateTime<Utc>) -> Result<SignalCounts>;

    /// Whether `user_id` has a work session with no end that started at or
    /// before `now`.
    async fn has_active_session(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool>;
}

/// Append-only audit of evaluations.
#[async_trait]
pub trait ScoreLedger: Send + Sync {
    async fn insert_score(&self, record: NewScoreRecord) -> Result<ScoreRecord>;

    /// Most recent records first.
    async fn scores_for_user(&self, user_id: i64, limit: i64) -> Result<Vec<ScoreRecord>>;
}
