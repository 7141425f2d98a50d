//! Time sources.
//!
//! Everything that decides "is this due yet" reads time through [`Clock`] so
//! repeat firing and retry backoff can be driven deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Simulated clock that only moves when advanced.
#[derive(Debug)]
pub struct SimulatedClock {
    base: DateTime<Utc>,
    elapsed_ms: AtomicU64,
}

impl SimulatedClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            elapsed_ms: AtomicU64::new(0),
        }
    }

    /// Anchored at the Unix epoch.
    pub fn deterministic() -> Self {
        Self::new(Utc.timestamp_millis_opt(0).single().unwrap_or_default())
    }

    pub fn advance(&self, duration: Duration) {
        self.elapsed_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.elapsed_ms.load(Ordering::Relaxed);
        self.base + chrono::Duration::milliseconds(elapsed as i64)
    }
}

/// First slot strictly after `now` on the grid of multiples of `every`
/// (measured from the Unix epoch). Independent registrations of the same
/// interval therefore agree on firing times.
pub fn next_aligned_slot(now: DateTime<Utc>, every: Duration) -> DateTime<Utc> {
    let every_ms = (every.as_millis() as i64).max(1);
    let now_ms = now.timestamp_millis();
    let next = (now_ms.div_euclid(every_ms) + 1) * every_ms;
    Utc.timestamp_millis_opt(next).single().unwrap_or(now)
}
