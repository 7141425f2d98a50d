//! Score records: the immutable audit trail of every evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const REASON_ACTIVE_WORK_SESSION: &str = "active_work_session";
pub const REASON_RECENT_ACTIVITY: &str = "recent_activity_signals";
pub const REASON_CHAT_ONLY: &str = "chat_only_activity";

/// Separator used when reason codes are stored as a single text column.
pub const REASON_SEPARATOR: char = ',';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    ActuallyWorking,
    LikelyIdle,
    NotWorking,
}

impl Classification {
    /// Thresholds: >= 70 working, <= 30 not working, otherwise idle.
    pub fn from_confidence(confidence: u8) -> Self {
        if confidence >= 70 {
            Classification::ActuallyWorking
        } else if confidence <= 30 {
            Classification::NotWorking
        } else {
            Classification::LikelyIdle
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Classification::ActuallyWorking => "ACTUALLY_WORKING",
            Classification::LikelyIdle => "LIKELY_IDLE",
            Classification::NotWorking => "NOT_WORKING",
        };
        write!(f, "{s}")
    }
}

/// What the scoring engine hands back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub classification: Classification,
    /// 0..=100
    pub confidence: u8,
    /// Reason codes in rule order. Empty when no rule fired.
    pub reasons: Vec<String>,
}

/// A persisted evaluation. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub id: i64,
    pub user_id: i64,
    pub score: u8,
    pub confidence: u8,
    pub reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert form of a [`ScoreRecord`].
#[derive(Debug, Clone)]
pub struct NewScoreRecord {
    pub user_id: i64,
    pub score: u8,
    pub confidence: u8,
    pub reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Join reason codes for the text column.
pub fn join_reasons(reasons: &[String]) -> String {
    reasons.join(&REASON_SEPARATOR.to_string())
}

/// Inverse of [`join_reasons`]; an empty column is an empty list.
pub fn split_reasons(joined: &str) -> Vec<String> {
    if joined.is_empty() {
        Vec::new()
    } else {
        joined.split(REASON_SEPARATOR).map(str::to_string).collect()
    }
}
