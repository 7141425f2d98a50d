//! Collaborator reads and the score ledger over Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::activity::SignalCounts;
use crate::model::score::{NewScoreRecord, ScoreRecord, join_reasons, split_reasons};
use crate::store::{ActivitySource, ScoreLedger, UserDirectory};

#[async_trait]
impl UserDirectory for super::Db {
    async fn user_ids(&self) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM users ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl ActivitySource for super::Db {
    /// Grouped count; raw signal rows never leave the database.
    async fn signal_counts(&self, user_id: i64, since: DateTime<Utc>) -> Result<SignalCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT signal_type, COUNT(*) FROM activity_signals
             WHERE user_id = $1 AND created_at >= $2
             GROUP BY signal_type",
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(self.pool())
        .await?;
        Ok(SignalCounts::from_groups(
            rows.into_iter().map(|(t, n)| (t, n.max(0) as u64)),
        ))
    }

    async fn has_active_session(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (
                SELECT 1 FROM work_sessions
                WHERE user_id = $1 AND end_at IS NULL AND start_at <= $2
             )",
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl ScoreLedger for super::Db {
    async fn insert_score(&self, record: NewScoreRecord) -> Result<ScoreRecord> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO score_records (user_id, score, confidence, reason, created_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
        )
        .bind(record.user_id)
        .bind(i16::from(record.score))
        .bind(i16::from(record.confidence))
        .bind(join_reasons(&record.reasons))
        .bind(record.created_at)
        .fetch_one(self.pool())
        .await?;

        Ok(ScoreRecord {
            id,
            user_id: record.user_id,
            score: record.score,
            confidence: record.confidence,
            reasons: record.reasons,
            created_at: record.created_at,
        })
    }

    async fn scores_for_user(&self, user_id: i64, limit: i64) -> Result<Vec<ScoreRecord>> {
        let rows: Vec<ScoreRow> = sqlx::query_as(
            "SELECT id, user_id, score, confidence, reason, created_at
             FROM score_records
             WHERE user_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(ScoreRow::into_record).collect())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ScoreRow {
    id: i64,
    user_id: i64,
    score: i16,
    confidence: i16,
    reason: String,
    created_at: DateTime<Utc>,
}

impl ScoreRow {
    fn into_record(self) -> ScoreRecord {
        ScoreRecord {
            id: self.id,
            user_id: self.user_id,
            score: self.score.clamp(0, 100) as u8,
            confidence: self.confidence.clamp(0, 100) as u8,
            reasons: split_reasons(&self.reason),
            created_at: self.created_at,
        }
    }
}
