//! Job execution span helpers.
//!
//! Provides span creation and status-transition recording for jobs
//! flowing through a consumer.

use tracing::Span;
use uuid::Uuid;

/// Start a span for one job attempt.
///
/// The `job.status` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_job_span(kind: &str, job_id: &Uuid, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.kind" = kind,
        "job.id" = %job_id,
        "job.attempt" = attempt,
        "job.status" = tracing::field::Empty,
    )
}

/// Record a status transition on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
