//! Collaborator-owned records read by the scoring engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CHAT_MESSAGE: &str = "chat_message";
pub const TASK_INTERACTION: &str = "task_interaction";
pub const PRESENCE_ONLINE: &str = "presence_online";

/// A timestamped interaction event. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySignal {
    pub id: i64,
    pub user_id: i64,
    /// e.g. [`CHAT_MESSAGE`], [`TASK_INTERACTION`], [`PRESENCE_ONLINE`].
    pub signal_type: String,
    pub created_at: DateTime<Utc>,
}

/// An interval during which a user is recorded as working.
/// `end_at == None` means the session is still open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkSession {
    pub id: i64,
    pub user_id: i64,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub productive: bool,
    pub task_id: Option<i64>,
}

impl WorkSession {
    /// Open and already started at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.end_at.is_none() && self.start_at <= now
    }
}

/// Result of the grouped count over one user's recent signals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalCounts {
    by_type: Vec<(String, u64)>,
}

impl SignalCounts {
    /// Build from `(type, count)` groups.
    pub fn from_groups(groups: impl IntoIterator<Item = (String, u64)>) -> Self {
        Self {
            by_type: groups.into_iter().collect(),
        }
    }

    pub fn total(&self) -> u64 {
        self.by_type.iter().map(|(_, n)| n).sum()
    }

    pub fn count_of(&self, signal_type: &str) -> u64 {
        self.by_type
            .iter()
            .filter(|(t, _)| t == signal_type)
            .map(|(_, n)| n)
            .sum()
    }
}
