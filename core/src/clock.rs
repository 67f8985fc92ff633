//! Time source for the engine
//!
//! All timestamps are UTC. Durations are carried as `f64` seconds, matching
//! how definitions express them, and converted at microsecond precision.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, TimeZone, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used by tests, simulations, and hosts
/// that drive the engine from their own game loop.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z
        Self::starting_at(Utc.timestamp_opt(1_704_067_200, 0).single().unwrap_or_default())
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `secs` (negative values move it back)
    pub fn advance(&self, secs: f64) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = add_secs(*now, secs);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Convert fractional seconds to a `TimeDelta`
pub fn delta_from_secs(secs: f64) -> TimeDelta {
    if !secs.is_finite() {
        return TimeDelta::zero();
    }
    TimeDelta::microseconds((secs * 1_000_000.0).round() as i64)
}

/// `at + secs`, saturating at the ends of the representable range
pub fn add_secs(at: DateTime<Utc>, secs: f64) -> DateTime<Utc> {
    let delta = delta_from_secs(secs);
    at.checked_add_signed(delta).unwrap_or(if delta < TimeDelta::zero() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// Seconds from `from` to `to` (negative if `to` is earlier)
pub fn secs_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}
