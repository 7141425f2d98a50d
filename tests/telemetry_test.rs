//! Integration tests for telemetry initialization and span helpers.

use std::time::Duration;

use pulse_rs::config::Config;
use pulse_rs::telemetry::{INSTRUMENTATION_SCOPE, TelemetryConfig};
use secrecy::SecretString;
use uuid::Uuid;

fn config(otel_endpoint: Option<&str>) -> Config {
    Config {
        database_url: SecretString::from("postgres://localhost/pulse".to_string()),
        otel_endpoint: otel_endpoint.map(str::to_string),
        log_level: "warn".to_string(),
        score_all_interval: Duration::from_secs(300),
        worker_concurrency: 4,
        poll_interval: Duration::from_secs(1),
        visibility_timeout: Duration::from_secs(60),
    }
}

#[test]
fn telemetry_config_follows_loaded_config() {
    let telemetry = TelemetryConfig::from_config(&config(Some("http://collector:4317")), "pulse");
    assert_eq!(telemetry.endpoint.as_deref(), Some("http://collector:4317"));
    assert_eq!(telemetry.service_name, "pulse");
    assert_eq!(telemetry.log_level, "warn");

    let local = TelemetryConfig::from_config(&config(None), "pulse-worker");
    assert!(local.endpoint.is_none());
    assert_eq!(local.service_name, "pulse-worker");
    assert_eq!(INSTRUMENTATION_SCOPE, "pulse-rs");
}

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // init_telemetry uses try_init(), so a second call returns Err
    // instead of panicking.
    let telemetry = TelemetryConfig::from_config(&config(None), "pulse-test");
    if let Ok(guard) = pulse_rs::telemetry::init_telemetry(telemetry) {
        assert!(!guard.is_exporting());
    }
}

#[test]
fn job_span_creates_and_records_transitions() {
    let id = Uuid::new_v4();
    let span = pulse_rs::telemetry::job::start_job_span("score-user", &id, 1);
    pulse_rs::telemetry::job::record_state_transition(&span, "waiting", "active");
    pulse_rs::telemetry::job::record_state_transition(&span, "active", "completed");
}

#[test]
fn metric_instruments_accept_recordings_without_a_provider() {
    use opentelemetry::KeyValue;
    use pulse_rs::telemetry::metrics;

    metrics::jobs_enqueued().add(1, &[KeyValue::new("kind", "score-user")]);
    metrics::job_outcomes().add(1, &[KeyValue::new("outcome", "failed")]);
    metrics::operation_duration_ms().record(1.5, &[KeyValue::new("operation", "test")]);
}
