//! In-memory broker: delivery, retry/backoff, repeatables, handle lifecycle.

use std::sync::Arc;
use std::time::Duration;

use pulse_rs::broker::{Broker, MemoryBackend};
use pulse_rs::clock::{Clock, SimulatedClock};
use pulse_rs::error::Error;
use pulse_rs::model::job::{
    BackoffPolicy, JobKind, JobOptions, JobPayload, JobStatus, RepeatRegistration,
};
use serde_json::json;

fn backend() -> (Arc<SimulatedClock>, MemoryBackend) {
    let clock = Arc::new(SimulatedClock::deterministic());
    let backend = MemoryBackend::new(clock.clone());
    (clock, backend)
}

fn three_attempts() -> JobOptions {
    JobOptions::new(3, BackoffPolicy::exponential(Duration::from_millis(3_000)))
}

// ---------------------------------------------------------------------------
// Payloads + policy
// ---------------------------------------------------------------------------

#[test]
fn payload_wire_form_uses_stable_names() {
    let payload = JobPayload::score_user(42);
    assert_eq!(payload.kind().name(), "score-user");
    assert_eq!(payload.to_json(), json!({"userId": 42}));
    assert_eq!(JobKind::ScoreAllUsers.name(), "score-all-users");
    assert_eq!(JobPayload::ScoreAllUsers.to_json(), json!({}));
}

#[test]
fn decode_rejects_malformed_payloads_as_validation_errors() {
    assert_eq!(
        JobPayload::decode("score-user", &json!({"userId": 5})).unwrap(),
        JobPayload::ScoreUser { user_id: 5 }
    );
    assert_eq!(
        JobPayload::decode("score-all-users", &json!({})).unwrap(),
        JobPayload::ScoreAllUsers
    );

    for (kind, payload) in [
        ("score-user", json!({})),
        ("score-user", json!({"userId": "five"})),
        ("score-user", json!({"user_id": 5})),
        ("score-all-users", json!([1, 2])),
        ("score-everyone", json!({})),
    ] {
        let err = JobPayload::decode(kind, &payload).unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{kind} {payload}: {err}");
        assert!(!err.is_retryable());
    }
}

#[test]
fn exponential_backoff_doubles_from_base() {
    let policy = BackoffPolicy::exponential(Duration::from_millis(5_000));
    assert_eq!(policy.delay_for(1), Duration::from_millis(5_000));
    assert_eq!(policy.delay_for(2), Duration::from_millis(10_000));
    assert_eq!(policy.delay_for(3), Duration::from_millis(20_000));

    let fixed = BackoffPolicy::fixed(Duration::from_millis(250));
    assert_eq!(fixed.delay_for(1), fixed.delay_for(4));
}

#[test]
fn status_transitions_follow_the_lifecycle() {
    use JobStatus::*;
    assert!(Waiting.can_transition_to(Active));
    assert!(Active.can_transition_to(Completed));
    assert!(Active.can_transition_to(Waiting));
    assert!(Active.can_transition_to(Failed));
    assert!(!Waiting.can_transition_to(Completed));
    assert!(!Failed.can_transition_to(Waiting));
    assert!(!Completed.can_transition_to(Active));
    assert!(Failed.is_terminal() && Completed.is_terminal());
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reserve_then_complete_purges_the_job() {
    let (_clock, backend) = backend();
    let broker = backend.connect();

    let id = broker
        .enqueue(JobPayload::score_user(1), three_attempts())
        .await
        .unwrap();
    assert_eq!(broker.get(id).await.unwrap().unwrap().status, JobStatus::Waiting);

    let job = broker.reserve().await.unwrap().expect("job is due");
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.attempts, 1);
    assert!(broker.reserve().await.unwrap().is_none());

    broker.complete(id).await.unwrap();
    assert!(broker.get(id).await.unwrap().is_none());
    assert_eq!(broker.counts().await.unwrap().waiting, 0);
}

#[tokio::test]
async fn jobs_are_delivered_in_enqueue_order() {
    let (_clock, backend) = backend();
    let broker = backend.connect();

    let first = broker.enqueue(JobPayload::score_user(1), three_attempts()).await.unwrap();
    let second = broker.enqueue(JobPayload::score_user(2), three_attempts()).await.unwrap();

    assert_eq!(broker.reserve().await.unwrap().unwrap().id, first);
    assert_eq!(broker.reserve().await.unwrap().unwrap().id, second);
}

#[tokio::test]
async fn delayed_job_is_not_delivered_early() {
    let (clock, backend) = backend();
    let broker = backend.connect();

    broker
        .enqueue(
            JobPayload::score_user(1),
            three_attempts().delay(Duration::from_secs(10)),
        )
        .await
        .unwrap();

    assert!(broker.reserve().await.unwrap().is_none());
    clock.advance(Duration::from_secs(10));
    assert!(broker.reserve().await.unwrap().is_some());
}

#[tokio::test]
async fn complete_requires_an_active_job() {
    let (_clock, backend) = backend();
    let broker = backend.connect();
    let id = broker.enqueue(JobPayload::score_user(1), three_attempts()).await.unwrap();

    let err = broker.complete(id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failures_retry_with_increasing_delay_then_fail() {
    let (clock, backend) = backend();
    let broker = backend.connect();
    let id = broker.enqueue(JobPayload::score_user(1), three_attempts()).await.unwrap();

    let mut delays = Vec::new();
    for attempt in 1..=3u32 {
        let job = broker.reserve().await.unwrap().expect("retry is due");
        assert_eq!(job.attempts, attempt);
        let status = broker.fail(id, "store unreachable", true).await.unwrap();

        let after = broker.get(id).await.unwrap().unwrap();
        if attempt < 3 {
            assert_eq!(status, JobStatus::Waiting);
            let delay = after.run_at - clock.now();
            delays.push(delay);
            // not due before the backoff elapses
            assert!(broker.reserve().await.unwrap().is_none());
            clock.advance(delay.to_std().unwrap());
        } else {
            assert_eq!(status, JobStatus::Failed);
            assert_eq!(after.attempts, 3);
            assert_eq!(after.last_error.as_deref(), Some("store unreachable"));
            assert!(after.finished_at.is_some());
        }
    }

    assert_eq!(
        delays,
        vec![
            chrono::Duration::milliseconds(3_000),
            chrono::Duration::milliseconds(6_000)
        ]
    );

    // Retained, queryable, never redelivered
    clock.advance(Duration::from_secs(3600));
    assert!(broker.reserve().await.unwrap().is_none());
    let failed = broker.failed_jobs().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(broker.counts().await.unwrap().failed, 1);
}

#[tokio::test]
async fn non_retryable_failure_is_terminal_on_first_attempt() {
    let (_clock, backend) = backend();
    let broker = backend.connect();
    let id = broker.enqueue(JobPayload::score_user(1), three_attempts()).await.unwrap();

    broker.reserve().await.unwrap().unwrap();
    let status = broker.fail(id, "invalid job payload", false).await.unwrap();
    assert_eq!(status, JobStatus::Failed);

    let job = broker.get(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.status, JobStatus::Failed);
}

// ---------------------------------------------------------------------------
// Repeatables
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeatable_registration_is_idempotent_per_kind_and_interval() {
    let (_clock, backend) = backend();
    let first = backend.connect();
    let second = backend.connect();
    let every = Duration::from_millis(300_000);

    let a = first
        .register_repeatable(JobPayload::ScoreAllUsers, three_attempts(), every)
        .await
        .unwrap();
    let b = second
        .register_repeatable(JobPayload::ScoreAllUsers, three_attempts(), every)
        .await
        .unwrap();
    assert_eq!(a, RepeatRegistration::Registered);
    assert_eq!(b, RepeatRegistration::AlreadyRegistered);
    assert_eq!(backend.repeatable_count().await, 1);

    // A different interval is a different definition
    let c = first
        .register_repeatable(
            JobPayload::ScoreAllUsers,
            three_attempts(),
            Duration::from_millis(60_000),
        )
        .await
        .unwrap();
    assert_eq!(c, RepeatRegistration::Registered);
    assert_eq!(backend.repeatable_count().await, 2);
}

#[tokio::test]
async fn repeatable_fires_once_per_interval() {
    let (clock, backend) = backend();
    let broker = backend.connect();
    broker
        .register_repeatable(
            JobPayload::ScoreAllUsers,
            three_attempts(),
            Duration::from_secs(300),
        )
        .await
        .unwrap();

    // Nothing before the first slot
    clock.advance(Duration::from_secs(299));
    assert!(broker.reserve().await.unwrap().is_none());

    let mut fired = 0;
    for _ in 0..6 {
        clock.advance(Duration::from_secs(300));
        while let Some(job) = broker.reserve().await.unwrap() {
            assert_eq!(job.kind, "score-all-users");
            assert_eq!(job.repeat_every_ms, Some(300_000));
            assert_eq!(job.max_attempts, 3);
            broker.complete(job.id).await.unwrap();
            fired += 1;
        }
    }
    assert_eq!(fired, 6);
}

#[tokio::test]
async fn missed_slots_do_not_fire_a_backlog() {
    let (clock, backend) = backend();
    let broker = backend.connect();
    broker
        .register_repeatable(
            JobPayload::ScoreAllUsers,
            three_attempts(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    clock.advance(Duration::from_secs(600));
    let mut fired = 0;
    while let Some(job) = broker.reserve().await.unwrap() {
        broker.complete(job.id).await.unwrap();
        fired += 1;
    }
    assert_eq!(fired, 1);
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

#[tokio::test]
async fn closing_a_handle_keeps_durable_jobs() {
    let (_clock, backend) = backend();
    let producer = backend.connect();
    let id = producer.enqueue(JobPayload::score_user(1), three_attempts()).await.unwrap();

    producer.close().await.unwrap();
    assert!(producer.is_closed());
    assert!(matches!(
        producer.enqueue(JobPayload::score_user(2), three_attempts()).await,
        Err(Error::Closed)
    ));
    assert!(matches!(producer.reserve().await, Err(Error::Closed)));

    let consumer = backend.connect();
    let job = consumer.reserve().await.unwrap().expect("job survived close");
    assert_eq!(job.id, id);
}

#[tokio::test]
async fn job_held_by_a_vanished_handle_is_redelivered_after_its_lease() {
    let (clock, backend) = backend();
    let backend = backend.with_visibility_timeout(Duration::from_secs(30));
    let crashed = backend.connect();
    let id = crashed.enqueue(JobPayload::score_user(5), three_attempts()).await.unwrap();
    assert_eq!(crashed.reserve().await.unwrap().unwrap().id, id);
    drop(crashed);

    let survivor = backend.connect();
    // Still leased
    clock.advance(Duration::from_secs(29));
    assert!(survivor.reserve().await.unwrap().is_none());
    assert_eq!(survivor.counts().await.unwrap().active, 1);

    clock.advance(Duration::from_secs(1));
    let job = survivor.reserve().await.unwrap().expect("lease expired");
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.last_error.as_deref(), Some("reservation lease expired"));

    survivor.complete(id).await.unwrap();
    assert!(survivor.get(id).await.unwrap().is_none());
}

#[tokio::test]
async fn expired_lease_on_the_last_attempt_fails_the_job() {
    let (clock, backend) = backend();
    let broker = backend.connect();
    let id = broker
        .enqueue(
            JobPayload::score_user(6),
            JobOptions::new(1, BackoffPolicy::fixed(Duration::from_secs(1))),
        )
        .await
        .unwrap();
    broker.reserve().await.unwrap().unwrap();

    clock.advance(Duration::from_secs(60));
    assert!(broker.reserve().await.unwrap().is_none());

    let job = broker.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.finished_at.is_some());
    assert_eq!(broker.failed_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn zero_repeat_interval_is_rejected() {
    let (_clock, backend) = backend();
    let broker = backend.connect();

    let err = broker
        .register_repeatable(JobPayload::ScoreAllUsers, three_attempts(), Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(backend.repeatable_count().await, 0);
}

#[tokio::test]
async fn enqueue_raw_accepts_external_wire_jobs() {
    let (clock, backend) = backend();
    let broker = backend.connect();

    let id = broker
        .enqueue_raw("score-user", json!({"userId": 11}), three_attempts())
        .await
        .unwrap();
    let job = broker.get(id).await.unwrap().unwrap();
    assert_eq!(job.decode().unwrap(), JobPayload::score_user(11));
    assert_eq!(job.created_at, clock.now());
}
