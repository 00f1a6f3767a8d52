use jiff::Timestamp;
#[cfg(feature = "mock-time")]
use std::sync::{Arc, Mutex};

/// Wall-clock source for refill timestamps and row audit columns.
///
/// With the `mock-time` feature the clock is shared, mutable state so tests
/// can advance time across hourly refill boundaries deterministically.
#[derive(Clone)]
pub struct TimeSource {
    #[cfg(feature = "mock-time")]
    time: Arc<Mutex<Timestamp>>,
}

impl TimeSource {
    #[allow(clippy::new_without_default)]
    #[cfg(not(feature = "mock-time"))]
    pub fn new() -> Self {
        Self {}
    }

    #[cfg(feature = "mock-time")]
    pub fn new(initial_time: Timestamp) -> Self {
        Self {
            time: Arc::new(Mutex::new(initial_time)),
        }
    }

    #[cfg(not(feature = "mock-time"))]
    pub fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    #[cfg(feature = "mock-time")]
    pub fn now(&self) -> Timestamp {
        *self.time.lock().unwrap()
    }

    #[cfg(feature = "mock-time")]
    pub fn advance(&self, duration: jiff::Span) {
        *self.time.lock().unwrap() += duration;
    }

    #[cfg(feature = "mock-time")]
    pub fn set(&self, time: Timestamp) {
        *self.time.lock().unwrap() = time;
    }
}

/// Truncate a timestamp to the start of its UTC hour.
///
/// Hourly refills stamp `last_refill_at` with the truncated hour so that
/// accrual boundaries stay aligned regardless of when the triggering
/// operation ran.
pub fn truncate_to_hour(ts: Timestamp) -> Timestamp {
    let second = ts.as_second() - ts.as_second().rem_euclid(3600);
    Timestamp::from_second(second).expect("hour truncation stays in range")
}
