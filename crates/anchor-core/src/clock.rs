//! Time source abstraction.
//!
//! Every timestamp the core hands out (audit events, expiry instants,
//! checkpoint creation) comes from a [`Clock`], so retention can be exercised
//! without sleeping.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, DurationRound, TimeDelta, Utc};

pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Truncate to whole microseconds, the precision persisted and hashed.
pub fn truncate_micros(dt: DateTime<Utc>) -> DateTime<Utc> {
  dt.duration_trunc(TimeDelta::microseconds(1)).unwrap_or(dt)
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> { truncate_micros(Utc::now()) }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self { now: Arc::new(Mutex::new(truncate_micros(start))) }
  }

  pub fn set(&self, to: DateTime<Utc>) {
    let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
    *guard = truncate_micros(to);
  }

  pub fn advance(&self, by: Duration) {
    let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
    *guard = truncate_micros(*guard + by);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|p| p.into_inner())
  }
}
