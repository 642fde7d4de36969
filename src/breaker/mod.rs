//! Circuit breaker
//!
//! A circuit breaker wraps an outgoing call and transitions between
//! `Closed -> Open -> HalfOpen -> Closed/Open`, with an `Isolated`
//! state entered and left only by administrative calls. Failure
//! accounting is delegated to a pluggable policy; state is persisted
//! through a [`crate::adapter::CircuitBreakerStore`] so multiple
//! processes sharing a backend share the breaker.

pub mod engine;
pub mod policy;

pub use engine::CircuitBreaker;
pub use policy::{
    CircuitBreakerPolicy, ClosedDecision, ConsecutiveMetrics, ConsecutivePolicy, CountMetrics,
    CountPolicy, HalfOpenDecision, SamplingMetrics, SamplingPolicy,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Circuit state, parameterized by the policy's metrics type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerState<M> {
    /// Calls execute; outcomes are accounted by the policy.
    Closed {
        /// Accumulated policy metrics.
        metrics: M,
    },
    /// Calls are short-circuited until the backoff for `attempt`
    /// elapses.
    Open {
        /// How many times the circuit has opened without recovering;
        /// always `>= 1`.
        attempt: u32,
        /// When this open period started.
        opened_at: DateTime<Utc>,
    },
    /// Probe calls execute; the policy decides recovery or relapse.
    HalfOpen {
        /// Carried over from the open period; always `>= 1`.
        attempt: u32,
        /// Metrics accumulated by probe calls.
        metrics: M,
    },
    /// Manually forced open; cleared only by an administrative reset.
    Isolated,
}

impl<M> BreakerState<M> {
    /// Whether calls may execute in this state.
    pub fn admits_calls(&self) -> bool {
        matches!(
            self,
            BreakerState::Closed { .. } | BreakerState::HalfOpen { .. }
        )
    }
}

/// Rejected because the circuit is open.
#[derive(Debug, Error)]
#[error("circuit '{key}' is open")]
pub struct CircuitOpenError {
    /// The breaker's namespaced key.
    pub key: String,
}

/// Rejected because the circuit was administratively isolated.
#[derive(Debug, Error)]
#[error("circuit '{key}' is isolated")]
pub struct CircuitIsolatedError {
    /// The breaker's namespaced key.
    pub key: String,
}
