//! Millisecond-resolution durations
//!
//! `TimeSpan` is the duration type used for TTLs, backoff delays and
//! blocking budgets. Unlike `std::time::Duration` it is signed: a
//! negative span projects *backwards* in time, which is how expired
//! timestamps are constructed.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::time::Duration;

/// An immutable duration with millisecond resolution.
///
/// Spans may be negative. Arithmetic saturates at the `i64` millisecond
/// range instead of overflowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeSpan(i64);

impl TimeSpan {
    /// The zero-length span.
    pub const ZERO: TimeSpan = TimeSpan(0);

    /// Create a span from milliseconds.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Create a span from whole seconds.
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000))
    }

    /// Create a span from whole minutes.
    pub const fn from_minutes(minutes: i64) -> Self {
        Self(minutes.saturating_mul(60_000))
    }

    /// Create a span from whole hours.
    pub const fn from_hours(hours: i64) -> Self {
        Self(hours.saturating_mul(3_600_000))
    }

    /// Create a span from whole days.
    pub const fn from_days(days: i64) -> Self {
        Self(days.saturating_mul(86_400_000))
    }

    /// Total length in milliseconds.
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Total length in fractional seconds.
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000.0
    }

    /// Whether the span is negative.
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Whether the span is exactly zero.
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Sum of two spans.
    pub fn add_span(&self, other: TimeSpan) -> TimeSpan {
        TimeSpan(self.0.saturating_add(other.0))
    }

    /// Difference of two spans.
    pub fn subtract(&self, other: TimeSpan) -> TimeSpan {
        TimeSpan(self.0.saturating_sub(other.0))
    }

    /// Scale the span by a factor, rounding to the nearest millisecond.
    pub fn multiply(&self, factor: f64) -> TimeSpan {
        TimeSpan((self.0 as f64 * factor).round() as i64)
    }

    /// Divide the span by a divisor, rounding to the nearest millisecond.
    ///
    /// # Panics
    ///
    /// Panics when `divisor` is zero.
    pub fn divide(&self, divisor: f64) -> TimeSpan {
        assert!(divisor != 0.0, "division of a TimeSpan by zero");
        TimeSpan((self.0 as f64 / divisor).round() as i64)
    }

    /// Project the span forwards from `now` to an end date.
    pub fn to_end_date(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + ChronoDuration::milliseconds(self.0)
    }

    /// Project the span *backwards* from `now` to a start date.
    pub fn to_start_date(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::milliseconds(self.0)
    }

    /// End date measured from the current wall clock.
    pub fn end_date(&self) -> DateTime<Utc> {
        self.to_end_date(Utc::now())
    }

    /// Start date measured from the current wall clock.
    pub fn start_date(&self) -> DateTime<Utc> {
        self.to_start_date(Utc::now())
    }

    /// Convert to a `std::time::Duration`; `None` for negative spans.
    pub fn to_duration(&self) -> Option<Duration> {
        u64::try_from(self.0).ok().map(Duration::from_millis)
    }

    /// Convert to a `std::time::Duration`, clamping negative spans to zero.
    pub fn to_duration_clamped(&self) -> Duration {
        Duration::from_millis(self.0.max(0) as u64)
    }
}

impl Add for TimeSpan {
    type Output = TimeSpan;

    fn add(self, rhs: TimeSpan) -> TimeSpan {
        self.add_span(rhs)
    }
}

impl Sub for TimeSpan {
    type Output = TimeSpan;

    fn sub(self, rhs: TimeSpan) -> TimeSpan {
        self.subtract(rhs)
    }
}

impl Neg for TimeSpan {
    type Output = TimeSpan;

    fn neg(self) -> TimeSpan {
        TimeSpan(self.0.saturating_neg())
    }
}

impl From<Duration> for TimeSpan {
    fn from(value: Duration) -> Self {
        TimeSpan(i64::try_from(value.as_millis()).unwrap_or(i64::MAX))
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}
