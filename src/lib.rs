//! # Keystone - Distributed Coordination & Resilience Primitives
//!
//! A unified set of coordination and resilience building blocks for
//! async Rust services:
//!
//! - `core`: Namespaced keys, signed durations, backoff policies, and
//!   cooperative cancellation
//! - `adapter`: Storage-neutral contracts with in-memory, SQLite,
//!   MySQL and Redis backends
//! - `coordination`: Exclusive locks, shared reader/writer locks and
//!   counting semaphores with provider facades
//! - `cache`: A typed, namespaced cache facade
//! - `resilience`: Composable middlewares (retry, timeout, hedging,
//!   fallback, observe)
//! - `breaker`: A persistent circuit-breaker state machine with
//!   pluggable failure-accounting policies
//! - `events`: The typed event surface every primitive publishes to
//! - `testing`: Conformance suites any backend must pass
//!
//! ## Example
//!
//! ```rust
//! use keystone::adapter::MemoryLockAdapter;
//! use keystone::coordination::LockProvider;
//! use keystone::core::Namespace;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let provider = LockProvider::new(
//!     Namespace::new("app/locks"),
//!     Arc::new(MemoryLockAdapter::new()),
//! );
//!
//! let lock = provider.create("order-42");
//! if lock.acquire().await.unwrap() {
//!     // ... critical section ...
//!     lock.release().await.unwrap();
//! }
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Foundational value types
pub mod core;

// Storage adapter contracts and backends
pub mod adapter;

// Circuit breaker
pub mod breaker;

// Cache facade
pub mod cache;

// Lock, shared lock and semaphore facades
pub mod coordination;

// Event surface
pub mod events;

// Resilience middleware pipeline
pub mod resilience;

// Backend conformance suites
pub mod testing;

// Re-export commonly used types
pub use crate::core::{AbortReason, Backoff, Key, Namespace, Signal, SignalController, TimeSpan};
pub use adapter::{AdapterError, AdapterResult, ResilienceOptions};
pub use breaker::{
    BreakerState, CircuitBreaker, CircuitBreakerPolicy, ConsecutivePolicy, CountPolicy,
    SamplingPolicy,
};
pub use cache::{Cache, CacheConfig, CacheError, TypeCacheError};
pub use coordination::{
    BlockingOptions, CoordinationError, CoordinationResult, FailedAcquireLockError,
    FailedRefreshLockError, FailedReleaseLockError, LimitMismatchError, Lock, LockProvider,
    LockState, RunOutcome, Semaphore, SemaphoreProvider, SharedLock, SharedLockProvider,
};
pub use events::{Event, EventBus, InMemoryEventBus, SubscriptionId};
pub use resilience::{
    AsyncError, ConcurrentHedging, ErrorPolicy, Fallback, Hooks, Invocation, Middleware,
    NamedOperation, Next, Observe, Retry, SequentialHedging, Timeout,
};
