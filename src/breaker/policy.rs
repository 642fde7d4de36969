//! Failure-accounting policies
//!
//! A policy owns the metrics stored inside [`BreakerState`] and decides
//! the transitions out of `Closed` and `HalfOpen`. Three policies are
//! packaged: consecutive failures, a fixed rolling window, and a
//! time-bucketed sampling window.

use crate::breaker::BreakerState;
use crate::core::TimeSpan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transition decision while the circuit is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedDecision {
    /// Keep executing calls.
    Stay,
    /// Open the circuit.
    ToOpen,
}

/// Transition decision while the circuit is half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfOpenDecision {
    /// Keep probing.
    Stay,
    /// Recovery confirmed; close the circuit.
    ToClosed,
    /// Relapse; reopen with an incremented attempt.
    ToOpen,
}

/// Pluggable failure accounting for the circuit-breaker engine.
pub trait CircuitBreakerPolicy: Send + Sync + 'static {
    /// The metrics persisted inside `Closed` and `HalfOpen` states.
    type Metrics: Clone + PartialEq + Send + Sync + 'static;

    /// Metrics of a circuit that has seen no calls.
    fn initial_metrics(&self) -> Self::Metrics;

    /// Account a successful call in `state` (only `Closed` and
    /// `HalfOpen` states are ever passed).
    fn track_success(&self, state: &BreakerState<Self::Metrics>, now: DateTime<Utc>)
        -> Self::Metrics;

    /// Account a failed call in `state`.
    fn track_failure(&self, state: &BreakerState<Self::Metrics>, now: DateTime<Utc>)
        -> Self::Metrics;

    /// Consulted before and after every closed-state call.
    fn when_closed(&self, metrics: &Self::Metrics, now: DateTime<Utc>) -> ClosedDecision;

    /// Consulted after every half-open probe.
    fn when_half_open(&self, metrics: &Self::Metrics, now: DateTime<Utc>) -> HalfOpenDecision;

    /// Metrics equality, used to skip persisting unchanged state.
    fn is_equal(&self, a: &Self::Metrics, b: &Self::Metrics) -> bool {
        a == b
    }
}

fn metrics_of<M: Clone>(state: &BreakerState<M>, initial: M) -> M {
    match state {
        BreakerState::Closed { metrics } | BreakerState::HalfOpen { metrics, .. } => {
            metrics.clone()
        }
        _ => initial,
    }
}

// ============================================================================
// Consecutive policy
// ============================================================================

/// Metrics of [`ConsecutivePolicy`]: current failure and success runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConsecutiveMetrics {
    /// Consecutive failures observed.
    pub failure_count: u32,
    /// Consecutive successes observed (half-open only).
    pub success_count: u32,
}

/// Opens after `failure_threshold` consecutive failures; closes again
/// after `success_threshold` consecutive half-open successes.
#[derive(Debug, Clone)]
pub struct ConsecutivePolicy {
    failure_threshold: u32,
    success_threshold: u32,
}

impl ConsecutivePolicy {
    /// Create a consecutive-failure policy.
    ///
    /// # Panics
    ///
    /// Panics when either threshold is zero.
    pub fn new(failure_threshold: u32, success_threshold: u32) -> Self {
        assert!(failure_threshold >= 1, "failure threshold must be >= 1");
        assert!(success_threshold >= 1, "success threshold must be >= 1");
        Self {
            failure_threshold,
            success_threshold,
        }
    }
}

impl CircuitBreakerPolicy for ConsecutivePolicy {
    type Metrics = ConsecutiveMetrics;

    fn initial_metrics(&self) -> Self::Metrics {
        ConsecutiveMetrics::default()
    }

    fn track_success(
        &self,
        state: &BreakerState<Self::Metrics>,
        _now: DateTime<Utc>,
    ) -> Self::Metrics {
        match state {
            // A success while closed breaks the failure run entirely.
            BreakerState::Closed { .. } => ConsecutiveMetrics::default(),
            _ => {
                let mut metrics = metrics_of(state, self.initial_metrics());
                metrics.success_count += 1;
                metrics
            }
        }
    }

    fn track_failure(
        &self,
        state: &BreakerState<Self::Metrics>,
        _now: DateTime<Utc>,
    ) -> Self::Metrics {
        let mut metrics = metrics_of(state, self.initial_metrics());
        metrics.failure_count += 1;
        metrics
    }

    fn when_closed(&self, metrics: &Self::Metrics, _now: DateTime<Utc>) -> ClosedDecision {
        if metrics.failure_count >= self.failure_threshold {
            ClosedDecision::ToOpen
        } else {
            ClosedDecision::Stay
        }
    }

    fn when_half_open(&self, metrics: &Self::Metrics, _now: DateTime<Utc>) -> HalfOpenDecision {
        if metrics.failure_count > 0 {
            HalfOpenDecision::ToOpen
        } else if metrics.success_count >= self.success_threshold {
            HalfOpenDecision::ToClosed
        } else {
            HalfOpenDecision::Stay
        }
    }
}

// ============================================================================
// Count policy
// ============================================================================

/// Metrics of [`CountPolicy`]: one fixed window of outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CountMetrics {
    /// When the current window started.
    pub window_started_at: DateTime<Utc>,
    /// Failures inside the window.
    pub failures: u32,
    /// Total calls inside the window.
    pub total: u32,
}

/// Opens when the failure ratio over a fixed rolling window reaches the
/// threshold with at least `minimum_throughput` calls observed.
#[derive(Debug, Clone)]
pub struct CountPolicy {
    failure_ratio: f64,
    minimum_throughput: u32,
    sampling_duration: TimeSpan,
    success_threshold: u32,
}

impl CountPolicy {
    /// Create a fixed-window policy.
    ///
    /// # Panics
    ///
    /// Panics when the ratio is outside `(0, 1]`, the throughput floor
    /// is zero, or the window is not positive.
    pub fn new(failure_ratio: f64, minimum_throughput: u32, sampling_duration: TimeSpan) -> Self {
        assert!(
            failure_ratio > 0.0 && failure_ratio <= 1.0,
            "failure ratio must be in (0, 1]"
        );
        assert!(minimum_throughput >= 1, "minimum throughput must be >= 1");
        assert!(
            sampling_duration.as_millis() > 0,
            "sampling duration must be positive"
        );
        Self {
            failure_ratio,
            minimum_throughput,
            sampling_duration,
            success_threshold: 1,
        }
    }

    /// Half-open probes required before closing (default 1).
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        assert!(threshold >= 1, "success threshold must be >= 1");
        self.success_threshold = threshold;
        self
    }

    fn bump(&self, state: &BreakerState<CountMetrics>, success: bool, now: DateTime<Utc>)
        -> CountMetrics {
        let mut metrics = metrics_of(state, self.window_at(now));
        if now >= self.sampling_duration.to_end_date(metrics.window_started_at) {
            metrics = self.window_at(now);
        }
        metrics.total += 1;
        if !success {
            metrics.failures += 1;
        }
        metrics
    }

    fn window_at(&self, now: DateTime<Utc>) -> CountMetrics {
        CountMetrics {
            window_started_at: now,
            failures: 0,
            total: 0,
        }
    }
}

impl CircuitBreakerPolicy for CountPolicy {
    type Metrics = CountMetrics;

    fn initial_metrics(&self) -> Self::Metrics {
        self.window_at(Utc::now())
    }

    fn track_success(
        &self,
        state: &BreakerState<Self::Metrics>,
        now: DateTime<Utc>,
    ) -> Self::Metrics {
        self.bump(state, true, now)
    }

    fn track_failure(
        &self,
        state: &BreakerState<Self::Metrics>,
        now: DateTime<Utc>,
    ) -> Self::Metrics {
        self.bump(state, false, now)
    }

    fn when_closed(&self, metrics: &Self::Metrics, now: DateTime<Utc>) -> ClosedDecision {
        if now >= self.sampling_duration.to_end_date(metrics.window_started_at) {
            // The whole window has aged out.
            return ClosedDecision::Stay;
        }
        if metrics.total >= self.minimum_throughput
            && metrics.failures as f64 / metrics.total as f64 >= self.failure_ratio
        {
            ClosedDecision::ToOpen
        } else {
            ClosedDecision::Stay
        }
    }

    fn when_half_open(&self, metrics: &Self::Metrics, _now: DateTime<Utc>) -> HalfOpenDecision {
        if metrics.failures > 0 {
            HalfOpenDecision::ToOpen
        } else if metrics.total >= self.success_threshold {
            HalfOpenDecision::ToClosed
        } else {
            HalfOpenDecision::Stay
        }
    }
}

// ============================================================================
// Sampling policy
// ============================================================================

/// One time bucket of [`SamplingMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleBucket {
    /// When this bucket started.
    pub started_at: DateTime<Utc>,
    /// Failures inside the bucket.
    pub failures: u32,
    /// Total calls inside the bucket.
    pub total: u32,
}

/// Metrics of [`SamplingPolicy`]: a ring of time buckets spanning the
/// sampling duration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SamplingMetrics {
    /// Live buckets, oldest first.
    pub buckets: Vec<SampleBucket>,
}

impl SamplingMetrics {
    fn failures(&self) -> u64 {
        self.buckets.iter().map(|b| b.failures as u64).sum()
    }

    fn total(&self) -> u64 {
        self.buckets.iter().map(|b| b.total as u64).sum()
    }
}

/// Opens on the failure ratio across a time-bucketed rolling window.
#[derive(Debug, Clone)]
pub struct SamplingPolicy {
    failure_ratio: f64,
    minimum_throughput: u32,
    sampling_duration: TimeSpan,
    bucket_count: u32,
    success_threshold: u32,
}

impl SamplingPolicy {
    /// Create a sampling policy with ten buckets.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`CountPolicy::new`].
    pub fn new(failure_ratio: f64, minimum_throughput: u32, sampling_duration: TimeSpan) -> Self {
        assert!(
            failure_ratio > 0.0 && failure_ratio <= 1.0,
            "failure ratio must be in (0, 1]"
        );
        assert!(minimum_throughput >= 1, "minimum throughput must be >= 1");
        assert!(
            sampling_duration.as_millis() > 0,
            "sampling duration must be positive"
        );
        Self {
            failure_ratio,
            minimum_throughput,
            sampling_duration,
            bucket_count: 10,
            success_threshold: 1,
        }
    }

    /// Number of buckets the window is divided into (default 10).
    pub fn bucket_count(mut self, count: u32) -> Self {
        assert!(count >= 1, "bucket count must be >= 1");
        self.bucket_count = count;
        self
    }

    /// Half-open probes required before closing (default 1).
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        assert!(threshold >= 1, "success threshold must be >= 1");
        self.success_threshold = threshold;
        self
    }

    fn bucket_length(&self) -> TimeSpan {
        self.sampling_duration.divide(self.bucket_count as f64)
    }

    fn prune(&self, metrics: &mut SamplingMetrics, now: DateTime<Utc>) {
        let horizon = self.sampling_duration.to_start_date(now);
        metrics.buckets.retain(|bucket| bucket.started_at > horizon);
    }

    fn bump(
        &self,
        state: &BreakerState<SamplingMetrics>,
        success: bool,
        now: DateTime<Utc>,
    ) -> SamplingMetrics {
        let mut metrics = metrics_of(state, SamplingMetrics::default());
        self.prune(&mut metrics, now);

        let bucket_len = self.bucket_length();
        let needs_new_bucket = metrics
            .buckets
            .last()
            .map_or(true, |bucket| now >= bucket_len.to_end_date(bucket.started_at));
        if needs_new_bucket {
            metrics.buckets.push(SampleBucket {
                started_at: now,
                failures: 0,
                total: 0,
            });
        }

        if let Some(bucket) = metrics.buckets.last_mut() {
            bucket.total += 1;
            if !success {
                bucket.failures += 1;
            }
        }
        metrics
    }
}

impl CircuitBreakerPolicy for SamplingPolicy {
    type Metrics = SamplingMetrics;

    fn initial_metrics(&self) -> Self::Metrics {
        SamplingMetrics::default()
    }

    fn track_success(
        &self,
        state: &BreakerState<Self::Metrics>,
        now: DateTime<Utc>,
    ) -> Self::Metrics {
        self.bump(state, true, now)
    }

    fn track_failure(
        &self,
        state: &BreakerState<Self::Metrics>,
        now: DateTime<Utc>,
    ) -> Self::Metrics {
        self.bump(state, false, now)
    }

    fn when_closed(&self, metrics: &Self::Metrics, now: DateTime<Utc>) -> ClosedDecision {
        let horizon = self.sampling_duration.to_start_date(now);
        let mut failures = 0u64;
        let mut total = 0u64;
        for bucket in metrics.buckets.iter().filter(|b| b.started_at > horizon) {
            failures += bucket.failures as u64;
            total += bucket.total as u64;
        }
        if total >= self.minimum_throughput as u64
            && failures as f64 / total as f64 >= self.failure_ratio
        {
            ClosedDecision::ToOpen
        } else {
            ClosedDecision::Stay
        }
    }

    fn when_half_open(&self, metrics: &Self::Metrics, _now: DateTime<Utc>) -> HalfOpenDecision {
        if metrics.failures() > 0 {
            HalfOpenDecision::ToOpen
        } else if metrics.total() >= self.success_threshold as u64 {
            HalfOpenDecision::ToClosed
        } else {
            HalfOpenDecision::Stay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed<M>(metrics: M) -> BreakerState<M> {
        BreakerState::Closed { metrics }
    }

    fn half_open<M>(metrics: M) -> BreakerState<M> {
        BreakerState::HalfOpen {
            attempt: 1,
            metrics,
        }
    }

    #[test]
    fn test_consecutive_opens_at_threshold() {
        let policy = ConsecutivePolicy::new(3, 2);
        let now = Utc::now();

        let mut metrics = policy.initial_metrics();
        for i in 1..=3 {
            metrics = policy.track_failure(&closed(metrics), now);
            let expected = if i < 3 {
                ClosedDecision::Stay
            } else {
                ClosedDecision::ToOpen
            };
            assert_eq!(policy.when_closed(&metrics, now), expected);
        }
    }

    #[test]
    fn test_consecutive_success_resets_closed_run() {
        let policy = ConsecutivePolicy::new(3, 2);
        let now = Utc::now();

        let mut metrics = policy.initial_metrics();
        metrics = policy.track_failure(&closed(metrics), now);
        metrics = policy.track_failure(&closed(metrics), now);
        metrics = policy.track_success(&closed(metrics), now);
        assert_eq!(metrics, ConsecutiveMetrics::default());
    }

    #[test]
    fn test_consecutive_half_open_failure_relapses() {
        let policy = ConsecutivePolicy::new(3, 2);
        let now = Utc::now();

        let metrics = policy.track_failure(&half_open(policy.initial_metrics()), now);
        assert_eq!(policy.when_half_open(&metrics, now), HalfOpenDecision::ToOpen);
    }

    #[test]
    fn test_consecutive_half_open_recovers_after_threshold() {
        let policy = ConsecutivePolicy::new(3, 2);
        let now = Utc::now();

        let mut metrics = policy.initial_metrics();
        metrics = policy.track_success(&half_open(metrics), now);
        assert_eq!(policy.when_half_open(&metrics, now), HalfOpenDecision::Stay);
        metrics = policy.track_success(&half_open(metrics), now);
        assert_eq!(
            policy.when_half_open(&metrics, now),
            HalfOpenDecision::ToClosed
        );
    }

    #[test]
    fn test_is_equal_is_reflexive_and_symmetric() {
        let policy = ConsecutivePolicy::new(3, 2);
        let a = policy.initial_metrics();
        let b = ConsecutiveMetrics {
            failure_count: 1,
            success_count: 0,
        };

        assert!(policy.is_equal(&a, &a));
        assert_eq!(policy.is_equal(&a, &b), policy.is_equal(&b, &a));
    }

    #[test]
    fn test_count_policy_needs_minimum_throughput() {
        let policy = CountPolicy::new(0.5, 4, TimeSpan::from_secs(30));
        let now = Utc::now();

        let mut metrics = policy.initial_metrics();
        for _ in 0..3 {
            metrics = policy.track_failure(&closed(metrics), now);
        }
        // 3 failures out of 3, but below the throughput floor.
        assert_eq!(policy.when_closed(&metrics, now), ClosedDecision::Stay);

        metrics = policy.track_failure(&closed(metrics), now);
        assert_eq!(policy.when_closed(&metrics, now), ClosedDecision::ToOpen);
    }

    #[test]
    fn test_count_policy_window_expires() {
        let policy = CountPolicy::new(0.5, 2, TimeSpan::from_millis(50));
        let now = Utc::now();

        let mut metrics = policy.initial_metrics();
        metrics = policy.track_failure(&closed(metrics), now);
        metrics = policy.track_failure(&closed(metrics), now);
        assert_eq!(policy.when_closed(&metrics, now), ClosedDecision::ToOpen);

        // The same metrics consulted after the window has aged out no
        // longer open the circuit.
        let later = TimeSpan::from_millis(60).to_end_date(now);
        assert_eq!(policy.when_closed(&metrics, later), ClosedDecision::Stay);

        // And the next tracked outcome starts a fresh window.
        let metrics = policy.track_failure(&closed(metrics), later);
        assert_eq!(metrics.total, 1);
    }

    #[test]
    fn test_sampling_policy_prunes_old_buckets() {
        let policy = SamplingPolicy::new(0.5, 2, TimeSpan::from_millis(100)).bucket_count(4);
        let now = Utc::now();

        let mut metrics = policy.initial_metrics();
        metrics = policy.track_failure(&closed(metrics), now);
        metrics = policy.track_failure(&closed(metrics), now);
        assert_eq!(policy.when_closed(&metrics, now), ClosedDecision::ToOpen);

        let later = TimeSpan::from_millis(150).to_end_date(now);
        assert_eq!(policy.when_closed(&metrics, later), ClosedDecision::Stay);

        metrics = policy.track_success(&closed(metrics), later);
        assert_eq!(metrics.buckets.len(), 1);
        assert_eq!(metrics.total(), 1);
    }
}
