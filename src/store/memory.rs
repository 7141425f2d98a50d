//! In-process store for tests and local runs.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{ActivitySource, ScoreLedger, UserDirectory};
use crate::error::Result;
use crate::model::activity::{ActivitySignal, SignalCounts, WorkSession};
use crate::model::score::{NewScoreRecord, ScoreRecord};

#[derive(Default)]
struct Inner {
    users: BTreeSet<i64>,
    signals: Vec<ActivitySignal>,
    sessions: Vec<WorkSession>,
    scores: Vec<ScoreRecord>,
}

/// Users, signals, sessions and score records held in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, user_id: i64) {
        self.inner.write().await.users.insert(user_id);
    }

    pub async fn add_signal(&self, user_id: i64, signal_type: &str, created_at: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        let id = inner.signals.len() as i64 + 1;
        inner.signals.push(ActivitySignal {
            id,
            user_id,
            signal_type: signal_type.to_string(),
            created_at,
        });
    }

    /// Open a session (no end) for `user_id`.
    pub async fn start_session(&self, user_id: i64, start_at: DateTime<Utc>) -> i64 {
        let mut inner = self.inner.write().await;
        let id = inner.sessions.len() as i64 + 1;
        inner.sessions.push(WorkSession {
            id,
            user_id,
            start_at,
            end_at: None,
            productive: true,
            task_id: None,
        });
        id
    }

    pub async fn end_session(&self, session_id: i64, end_at: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.iter_mut().find(|s| s.id == session_id) {
            session.end_at = Some(end_at);
        }
    }

    /// Every score record, oldest first.
    pub async fn all_scores(&self) -> Vec<ScoreRecord> {
        self.inner.read().await.scores.clone()
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn user_ids(&self) -> Result<Vec<i64>> {
        Ok(self.inner.read().await.users.iter().copied().collect())
    }
}

#[async_trait]
impl ActivitySource for MemoryStore {
    async fn signal_counts(&self, user_id: i64, since: DateTime<Utc>) -> Result<SignalCounts> {
        let inner = self.inner.read().await;
        let mut groups: Vec<(String, u64)> = Vec::new();
        for signal in inner
            .signals
            .iter()
            .filter(|s| s.user_id == user_id && s.created_at >= since)
        {
            match groups.iter_mut().find(|(t, _)| *t == signal.signal_type) {
                Some((_, n)) => *n += 1,
                None => groups.push((signal.signal_type.clone(), 1)),
            }
        }
        Ok(SignalCounts::from_groups(groups))
    }

    async fn has_active_session(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .iter()
            .any(|s| s.user_id == user_id && s.is_active_at(now)))
    }
}

#[async_trait]
impl ScoreLedger for MemoryStore {
    async fn insert_score(&self, record: NewScoreRecord) -> Result<ScoreRecord> {
        let mut inner = self.inner.write().await;
        let stored = ScoreRecord {
            id: inner.scores.len() as i64 + 1,
            user_id: record.user_id,
            score: record.score,
            confidence: record.confidence,
            reasons: record.reasons,
            created_at: record.created_at,
        };
        inner.scores.push(stored.clone());
        Ok(stored)
    }

    async fn scores_for_user(&self, user_id: i64, limit: i64) -> Result<Vec<ScoreRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .scores
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
