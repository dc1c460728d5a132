//! Time helpers: clocks and job delays.
//!
//! Drivers never call `Utc::now()` directly; they read time through a
//! [`Clock`] so availability and reservation-expiry rules can be exercised
//! with a [`ManualClock`] in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Source of "now" for drivers and the worker.
pub trait Clock: Send + Sync + core::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Current time as unix seconds (the resolution every backend stores).
    fn timestamp(&self) -> i64 {
        self.now().timestamp()
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations.
///
/// Clones share the same instant, so a test can keep one handle and advance
/// the time seen by every driver built from another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    /// A clock starting at the current wall time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// How long a job must stay invisible after push or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Relative delay in whole seconds.
    Seconds(u64),
    /// Absolute availability time.
    Until(DateTime<Utc>),
}

impl Delay {
    pub const NONE: Delay = Delay::Seconds(0);

    /// Seconds remaining from `now` until the job becomes available (never negative).
    pub fn seconds_from(&self, now: DateTime<Utc>) -> u64 {
        match self {
            Delay::Seconds(secs) => *secs,
            Delay::Until(at) => (*at - now).num_seconds().max(0) as u64,
        }
    }

    /// Unix timestamp at which the job becomes available.
    pub fn available_at(&self, now: DateTime<Utc>) -> i64 {
        match self {
            Delay::Seconds(secs) => now.timestamp() + *secs as i64,
            Delay::Until(at) => at.timestamp().max(now.timestamp()),
        }
    }

    pub fn is_zero(&self, now: DateTime<Utc>) -> bool {
        self.seconds_from(now) == 0
    }
}

impl Default for Delay {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<u64> for Delay {
    fn from(secs: u64) -> Self {
        Delay::Seconds(secs)
    }
}

impl From<Duration> for Delay {
    fn from(duration: Duration) -> Self {
        Delay::Seconds(duration.as_secs())
    }
}

impl From<DateTime<Utc>> for Delay {
    fn from(at: DateTime<Utc>) -> Self {
        Delay::Until(at)
    }
}
