// marketplace/src/clock.rs

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;

/// Source of "now" for pipelines; tests pin and advance it.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;

  fn today(&self) -> NaiveDate {
    self.now().date_naive()
  }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

#[derive(Debug)]
pub struct FixedClock {
  now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
  pub fn new(now: DateTime<Utc>) -> Self {
    Self { now: Mutex::new(now) }
  }

  pub fn set(&self, now: DateTime<Utc>) {
    *self.now.lock() = now;
  }

  pub fn advance(&self, by: Duration) {
    let mut guard = self.now.lock();
    *guard += by;
  }
}

impl Clock for FixedClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock()
  }
}
