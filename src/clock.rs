//! Injected time sources and the urgency-derived timeout policy.
//!
//! Review of a request is human-paced (hours to days), so the engine never
//! couples deadlines to wall-clock sleeps. All timestamps come from a `Clock`
//! injected by the caller; tests drive a `ManualClock` forward explicitly and
//! trigger the timeout sweep deterministically.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::domain::request::Urgency;

/// Source of "now" for the engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
///
/// Clones share the same underlying instant, so a clock handed to the engine
/// can be advanced from the test body.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock();
        *now = *now + delta;
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// How long a pending request may wait for review before it is forced into a
/// synthetic timeout rejection, by urgency.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    pub high: Duration,
    pub normal: Duration,
    pub low: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            high: Duration::hours(24),
            normal: Duration::hours(72),
            low: Duration::days(7),
        }
    }
}

impl TimeoutPolicy {
    /// Review window for a request of the given urgency.
    pub fn window(&self, urgency: Urgency) -> Duration {
        match urgency {
            Urgency::High => self.high,
            Urgency::Normal => self.normal,
            Urgency::Low => self.low,
        }
    }
}
