//! Rule-based activity scoring with explainable reason codes.
//!
//! [`evaluate`] is the pure rule set. [`ScoringEngine::score_user`] gathers
//! its inputs for one user over [`SCORING_WINDOW`], evaluates, and appends
//! one [`ScoreRecord`](crate::model::score::ScoreRecord) to the ledger.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::model::activity::{CHAT_MESSAGE, SignalCounts, TASK_INTERACTION};
use crate::model::score::{
    Classification, Evaluation, NewScoreRecord, REASON_ACTIVE_WORK_SESSION, REASON_CHAT_ONLY,
    REASON_RECENT_ACTIVITY,
};
use crate::store::{ActivitySource, ScoreLedger};
use crate::telemetry::metrics;

/// Trailing window for "recent" signals. Shared by every rule.
pub const SCORING_WINDOW: Duration = Duration::from_secs(5 * 60);

const NEUTRAL_SCORE: i64 = 50;
const ACTIVE_SESSION_BONUS: i64 = 30;
const PER_SIGNAL_BONUS: i64 = 5;
const MAX_SIGNAL_BONUS: i64 = 20;
const CHAT_ONLY_PENALTY: i64 = 25;

/// Aggregated inputs for one evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoreInputs {
    pub total_signals: u64,
    pub chat_count: u64,
    pub task_count: u64,
    pub has_active_session: bool,
}

impl ScoreInputs {
    pub fn from_counts(counts: &SignalCounts, has_active_session: bool) -> Self {
        Self {
            total_signals: counts.total(),
            chat_count: counts.count_of(CHAT_MESSAGE),
            task_count: counts.count_of(TASK_INTERACTION),
            has_active_session,
        }
    }
}

/// Apply the rules in fixed order. Reasons are emitted in that order.
pub fn evaluate(inputs: &ScoreInputs) -> Evaluation {
    let mut score = NEUTRAL_SCORE;
    let mut reasons = Vec::new();

    if inputs.has_active_session {
        score += ACTIVE_SESSION_BONUS;
        reasons.push(REASON_ACTIVE_WORK_SESSION.to_string());
    }

    if inputs.total_signals > 0 {
        let signals = i64::try_from(inputs.total_signals).unwrap_or(i64::MAX);
        score += signals.saturating_mul(PER_SIGNAL_BONUS).min(MAX_SIGNAL_BONUS);
        reasons.push(REASON_RECENT_ACTIVITY.to_string());
    }

    if inputs.chat_count > 0 && inputs.task_count == 0 {
        score -= CHAT_ONLY_PENALTY;
        reasons.push(REASON_CHAT_ONLY.to_string());
    }

    let confidence = score.clamp(0, 100) as u8;
    Evaluation {
        classification: Classification::from_confidence(confidence),
        confidence,
        reasons,
    }
}

/// Scores one user at a time against the collaborator stores.
pub struct ScoringEngine {
    activity: Arc<dyn ActivitySource>,
    ledger: Arc<dyn ScoreLedger>,
    clock: Arc<dyn Clock>,
}

impl ScoringEngine {
    pub fn new(activity: Arc<dyn ActivitySource>, ledger: Arc<dyn ScoreLedger>) -> Self {
        Self::with_clock(activity, ledger, Arc::new(SystemClock))
    }

    pub fn with_clock(
        activity: Arc<dyn ActivitySource>,
        ledger: Arc<dyn ScoreLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            activity,
            ledger,
            clock,
        }
    }

    /// Gather the window's aggregates for `user_id`.
    pub async fn gather_inputs(&self, user_id: i64) -> Result<ScoreInputs> {
        let now = self.clock.now();
        let since = now - chrono::Duration::milliseconds(SCORING_WINDOW.as_millis() as i64);
        let counts = self.activity.signal_counts(user_id, since).await?;
        let has_active_session = self.activity.has_active_session(user_id, now).await?;
        Ok(ScoreInputs::from_counts(&counts, has_active_session))
    }

    /// Evaluate `user_id` and append exactly one score record.
    pub async fn score_user(&self, user_id: i64) -> Result<Evaluation> {
        let start = Instant::now();
        let inputs = self.gather_inputs(user_id).await?;
        debug!(user_id, ?inputs, "scoring inputs gathered");

        let evaluation = evaluate(&inputs);
        let record = self
            .ledger
            .insert_score(NewScoreRecord {
                user_id,
                score: evaluation.confidence,
                confidence: evaluation.confidence,
                reasons: evaluation.reasons.clone(),
                created_at: self.clock.now(),
            })
            .await?;

        metrics::scores_recorded().add(
            1,
            &[KeyValue::new(
                "classification",
                evaluation.classification.to_string(),
            )],
        );
        metrics::operation_duration_ms().record(
            start.elapsed().as_millis() as f64,
            &[KeyValue::new("operation", "score.user")],
        );
        info!(
            user_id,
            record_id = record.id,
            classification = %evaluation.classification,
            confidence = evaluation.confidence,
            reasons = ?evaluation.reasons,
            "user scored"
        );
        Ok(evaluation)
    }
}
