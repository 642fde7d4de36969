//! Resilience middleware pipeline
//!
//! Composable async wrappers around a user operation:
//! - `retry`: bounded re-execution with backoff and error policies
//! - `timeout`: deadline racing with scoped cancellation
//! - `hedging`: sequential or concurrent redundant calls, first success wins
//! - `fallback`: substitute value when the error matches a policy
//! - `observe`: lifecycle callbacks with wall-time measurement
//!
//! Middlewares compose outer-to-inner: `[A, B, C]` runs
//! `A(B(C(operation)))`. A cancellation `Signal` travels with the
//! invocation and is sampled at every suspension point.

pub mod fallback;
pub mod hedging;
pub mod hooks;
pub mod observe;
pub mod retry;
pub mod timeout;

pub use fallback::{Fallback, FallbackValue};
pub use hedging::{ConcurrentHedging, NamedOperation, SequentialHedging};
pub use hooks::{Hooks, Invocation, Middleware, Next, OperationFn};
pub use observe::Observe;
pub use retry::Retry;
pub use timeout::Timeout;

use crate::core::{AbortReason, TimeSpan};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Boxed future used by operations and lazy values.
pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, T>;

/// Root error type of the middleware pipeline.
///
/// Application errors travel as an opaque [`anyhow::Error`] so callers
/// can downcast back to their own types; the pipeline's own failures are
/// dedicated variants carrying their cause chains.
#[derive(Debug, Error)]
pub enum AsyncError {
    /// A deadline elapsed before the operation completed.
    #[error("operation timed out after {waited}")]
    Timeout {
        /// How long the operation was allowed to run.
        waited: TimeSpan,
    },

    /// The invocation's scope was aborted.
    #[error("operation aborted: {reason:?}")]
    Aborted {
        /// Why the scope was aborted.
        reason: AbortReason,
    },

    /// Every retry attempt failed; `cause` is the last attempt's error.
    #[error("operation failed after {attempts} attempts")]
    RetryExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The error of the final attempt.
        #[source]
        cause: Box<AsyncError>,
    },

    /// Every hedged candidate failed.
    #[error("all {} hedged candidates failed", .errors.len())]
    Hedging {
        /// Per-candidate failures, won-race aborts excluded.
        errors: Vec<AsyncError>,
    },

    /// An error raised by the user operation or a backend.
    #[error(transparent)]
    Application(#[from] anyhow::Error),
}

impl AsyncError {
    /// Wrap a typed application error.
    pub fn application<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        AsyncError::Application(anyhow::Error::new(error))
    }

    /// Wrap a plain message as an application error.
    pub fn message(message: impl fmt::Display) -> Self {
        AsyncError::Application(anyhow::anyhow!("{message}"))
    }

    /// Downcast an application error to a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + Send + Sync + 'static,
    {
        match self {
            AsyncError::Application(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Whether this is an application error of type `E`.
    pub fn is<E>(&self) -> bool
    where
        E: StdError + Send + Sync + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }

    /// Whether the error is a cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, AsyncError::Aborted { .. })
    }
}

/// Decides which errors a middleware reacts to.
///
/// The default policy matches every error except cancellations, which
/// are always propagated untouched.
#[derive(Clone)]
pub struct ErrorPolicy {
    matcher: Arc<dyn Fn(&AsyncError) -> bool + Send + Sync>,
}

impl ErrorPolicy {
    /// Match every non-cancellation error.
    pub fn all() -> Self {
        Self {
            matcher: Arc::new(|_| true),
        }
    }

    /// Match application errors of a concrete type.
    pub fn of<E>() -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            matcher: Arc::new(|error| error.is::<E>()),
        }
    }

    /// Match errors accepted by an arbitrary predicate.
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&AsyncError) -> bool + Send + Sync + 'static,
    {
        Self {
            matcher: Arc::new(predicate),
        }
    }

    /// Whether the policy matches `error`. Cancellations never match.
    pub fn matches(&self, error: &AsyncError) -> bool {
        if error.is_aborted() {
            return false;
        }
        (self.matcher)(error)
    }
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorPolicy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("first")]
    struct FirstError;

    #[derive(Debug, Error)]
    #[error("second")]
    struct SecondError;

    #[test]
    fn test_downcast() {
        let error = AsyncError::application(FirstError);
        assert!(error.is::<FirstError>());
        assert!(!error.is::<SecondError>());
    }

    #[test]
    fn test_typed_policy() {
        let policy = ErrorPolicy::of::<FirstError>();
        assert!(policy.matches(&AsyncError::application(FirstError)));
        assert!(!policy.matches(&AsyncError::application(SecondError)));
    }

    #[test]
    fn test_policy_never_matches_cancellation() {
        let policy = ErrorPolicy::all();
        let aborted = AsyncError::Aborted {
            reason: AbortReason::TimedOut,
        };
        assert!(!policy.matches(&aborted));
    }

    #[test]
    fn test_cause_chain_is_preserved() {
        let cause = AsyncError::application(FirstError);
        let wrapped = AsyncError::RetryExhausted {
            attempts: 3,
            cause: Box::new(cause),
        };

        let source = StdError::source(&wrapped).expect("cause should be chained");
        assert_eq!(source.to_string(), "first");
    }
}
