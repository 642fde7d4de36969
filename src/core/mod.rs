//! Foundational value types shared by every primitive
//!
//! This module provides:
//! - Namespaced key construction (`Namespace`, `Key`)
//! - A signed, millisecond-resolution duration (`TimeSpan`)
//! - Backoff policies for retry loops and circuit-breaker recovery
//! - A cooperative cancellation token (`Signal`)

pub mod backoff;
pub mod key;
pub mod signal;
pub mod timespan;

pub use backoff::Backoff;
pub use key::{Key, Namespace};
pub use signal::{AbortReason, Signal, SignalController};
pub use timespan::TimeSpan;
