//! Cooperative cancellation
//!
//! A `Signal` is threaded through the middleware pipeline and sampled at
//! suspension points; it is never used to force-interrupt an in-flight
//! backend call. Child scopes let a middleware (timeout, hedging) abort
//! its own subtree without tearing down the callers above it.

use std::future::pending;
use tokio::sync::watch;

/// Why a scope was aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Cancelled by the caller or an outer scope.
    Cancelled(String),
    /// A timeout middleware fired.
    TimedOut,
    /// A hedging race was won by a sibling; losers are aborted with this
    /// sentinel so it can be excluded from failure accounting.
    Resolved,
}

/// The write side of a cancellation scope.
#[derive(Debug)]
pub struct SignalController {
    tx: watch::Sender<Option<AbortReason>>,
}

impl SignalController {
    /// Create a fresh root scope.
    pub fn new() -> (SignalController, Signal) {
        let (tx, rx) = watch::channel(None);
        (SignalController { tx }, Signal { scopes: vec![rx] })
    }

    /// Abort the scope. Aborting an already-aborted scope keeps the
    /// first reason.
    pub fn abort(&self, reason: AbortReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Whether this scope has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// The read side of a cancellation scope.
///
/// A signal observes its own scope plus every ancestor scope it was
/// derived from; any of them aborting aborts the signal.
#[derive(Debug, Clone)]
pub struct Signal {
    scopes: Vec<watch::Receiver<Option<AbortReason>>>,
}

impl Signal {
    /// A signal that can never be aborted.
    pub fn never() -> Signal {
        Signal { scopes: Vec::new() }
    }

    /// Whether any observed scope has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.scopes.iter().any(|rx| rx.borrow().is_some())
    }

    /// The reason of the first aborted scope, outermost first.
    pub fn reason(&self) -> Option<AbortReason> {
        self.scopes.iter().find_map(|rx| rx.borrow().clone())
    }

    /// Derive a child scope: the returned signal aborts when either the
    /// new controller or any ancestor scope aborts.
    pub fn child(&self) -> (SignalController, Signal) {
        let (tx, rx) = watch::channel(None);
        let mut scopes = self.scopes.clone();
        scopes.push(rx);
        (SignalController { tx }, Signal { scopes })
    }

    /// Resolve once any observed scope aborts. Never resolves for a
    /// signal with no scopes.
    pub async fn aborted(&self) -> AbortReason {
        if let Some(reason) = self.reason() {
            return reason;
        }
        if self.scopes.is_empty() {
            pending::<()>().await;
        }

        let waiters = self
            .scopes
            .iter()
            .cloned()
            .map(|mut rx| {
                Box::pin(async move {
                    loop {
                        if let Some(reason) = rx.borrow_and_update().clone() {
                            return reason;
                        }
                        if rx.changed().await.is_err() {
                            // Controller dropped without aborting; this
                            // scope can never fire.
                            pending::<()>().await;
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        let (reason, _, _) = futures::future::select_all(waiters).await;
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_abort_is_observed() {
        let (controller, signal) = SignalController::new();
        assert!(!signal.is_aborted());

        controller.abort(AbortReason::Cancelled("shutdown".into()));
        assert!(signal.is_aborted());
        assert_eq!(
            signal.reason(),
            Some(AbortReason::Cancelled("shutdown".into()))
        );
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let (controller, signal) = SignalController::new();
        controller.abort(AbortReason::TimedOut);
        controller.abort(AbortReason::Resolved);
        assert_eq!(signal.reason(), Some(AbortReason::TimedOut));
    }

    #[tokio::test]
    async fn test_child_observes_parent_abort() {
        let (parent, signal) = SignalController::new();
        let (_child_controller, child_signal) = signal.child();

        parent.abort(AbortReason::TimedOut);
        assert!(child_signal.is_aborted());
        assert_eq!(child_signal.reason(), Some(AbortReason::TimedOut));
    }

    #[tokio::test]
    async fn test_parent_does_not_observe_child_abort() {
        let (_parent, signal) = SignalController::new();
        let (child_controller, child_signal) = signal.child();

        child_controller.abort(AbortReason::Resolved);
        assert!(child_signal.is_aborted());
        assert!(!signal.is_aborted());
    }

    #[tokio::test]
    async fn test_aborted_future_resolves() {
        let (controller, signal) = SignalController::new();

        let waiter = tokio::spawn(async move { signal.aborted().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.abort(AbortReason::TimedOut);

        let reason = waiter.await.unwrap();
        assert_eq!(reason, AbortReason::TimedOut);
    }

    #[tokio::test]
    async fn test_never_signal() {
        let signal = Signal::never();
        assert!(!signal.is_aborted());
        assert!(signal.reason().is_none());

        tokio::select! {
            _ = signal.aborted() => panic!("never signal must not resolve"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
    }
}
