//! Metric instrument factories for pulse-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"pulse-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

use super::INSTRUMENTATION_SCOPE;

/// Returns the shared meter for pulse-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter(INSTRUMENTATION_SCOPE)
}

/// Counter: jobs enqueued.
/// Labels: `kind`, `source` ("producer" | "repeat").
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("pulse.jobs.enqueued")
        .with_description("Number of jobs enqueued")
        .build()
}

/// Counter: job status transitions recorded by a broker.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("pulse.jobs.state_transitions")
        .with_description("Number of job status transitions")
        .build()
}

/// Counter: job attempt outcomes seen by the consumer.
/// Labels: `kind`, `outcome` ("completed" | "retrying" | "failed").
pub fn job_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("pulse.jobs.outcomes")
        .with_description("Job attempt outcomes")
        .build()
}

/// Counter: repeatable registrations.
/// Labels: `kind`, `result` ("registered" | "already_registered").
pub fn repeatable_registrations() -> Counter<u64> {
    meter()
        .u64_counter("pulse.repeatable.registrations")
        .with_description("Repeatable job registrations")
        .build()
}

/// Counter: score records persisted.
/// Labels: `classification`.
pub fn scores_recorded() -> Counter<u64> {
    meter()
        .u64_counter("pulse.scores.recorded")
        .with_description("Number of score records persisted")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("pulse.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
