//! Middleware composition
//!
//! A middleware wraps the rest of the chain through a re-runnable
//! [`Next`] value; the chain terminates in the user operation. The
//! [`Invocation`] travels the whole chain and carries an open context
//! record plus the cancellation scope.

use crate::core::{AbortReason, Signal, SignalController};
use crate::resilience::{AsyncError, BoxFuture};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// The user operation at the end of a middleware chain.
pub type OperationFn<T> =
    Arc<dyn Fn(Invocation) -> BoxFuture<'static, Result<T, AsyncError>> + Send + Sync>;

/// One invocation travelling through a middleware chain.
///
/// Cloning is cheap; clones share the context record. Deriving a child
/// scope gives a middleware its own abort authority without touching
/// the scopes above it.
#[derive(Clone)]
pub struct Invocation {
    context: Arc<Mutex<HashMap<String, serde_json::Value>>>,
    signal: Signal,
    controller: Arc<SignalController>,
}

impl Invocation {
    /// A fresh root invocation with its own scope.
    pub fn root() -> Self {
        let (controller, signal) = SignalController::new();
        Self {
            context: Arc::new(Mutex::new(HashMap::new())),
            signal,
            controller: Arc::new(controller),
        }
    }

    /// The cancellation signal observed by this invocation.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Abort this invocation's scope (and every scope derived from it).
    pub fn abort(&self, reason: AbortReason) {
        self.controller.abort(reason);
    }

    /// Derive a child invocation sharing the context but owning a new
    /// scope nested inside this one.
    pub fn child(&self) -> Self {
        let (controller, signal) = self.signal.child();
        Self {
            context: Arc::clone(&self.context),
            signal,
            controller: Arc::new(controller),
        }
    }

    /// Store a context value visible to the rest of the chain.
    pub fn set_value(&self, key: impl Into<String>, value: serde_json::Value) {
        self.context.lock().insert(key.into(), value);
    }

    /// Read a context value.
    pub fn get_value(&self, key: &str) -> Option<serde_json::Value> {
        self.context.lock().get(key).cloned()
    }
}

impl Default for Invocation {
    fn default() -> Self {
        Self::root()
    }
}

/// An async wrapper around the rest of a middleware chain.
#[async_trait]
pub trait Middleware<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Run this middleware; `next` invokes the remainder of the chain
    /// and may be run more than once.
    async fn handle(&self, inv: &Invocation, next: Next<'_, T>) -> Result<T, AsyncError>;
}

enum NextTerminal<'a, T> {
    Operation(&'a OperationFn<T>),
    Nested(&'a Next<'a, T>),
}

impl<'a, T> Clone for NextTerminal<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T> Copy for NextTerminal<'a, T> {}

/// The remainder of a middleware chain. Copyable so a middleware can
/// run it repeatedly (retry) or concurrently (hedging).
pub struct Next<'a, T> {
    middlewares: &'a [Arc<dyn Middleware<T>>],
    terminal: NextTerminal<'a, T>,
}

impl<'a, T> Clone for Next<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T> Copy for Next<'a, T> {}

impl<'a, T> Next<'a, T>
where
    T: Send + 'static,
{
    /// Chain `middlewares` in front of a terminal operation.
    pub fn new(middlewares: &'a [Arc<dyn Middleware<T>>], operation: &'a OperationFn<T>) -> Self {
        Self {
            middlewares,
            terminal: NextTerminal::Operation(operation),
        }
    }

    /// Chain `middlewares` in front of another chain. Used by hedging to
    /// wrap the primary uniformly with the per-candidate stack.
    pub fn nested(middlewares: &'a [Arc<dyn Middleware<T>>], inner: &'a Next<'a, T>) -> Self {
        Self {
            middlewares,
            terminal: NextTerminal::Nested(inner),
        }
    }

    /// Invoke the remainder of the chain.
    pub async fn run(&self, inv: &Invocation) -> Result<T, AsyncError> {
        match self.middlewares.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    middlewares: rest,
                    terminal: self.terminal,
                };
                head.handle(inv, next).await
            }
            None => match self.terminal {
                NextTerminal::Operation(operation) => operation(inv.clone()).await,
                NextTerminal::Nested(inner) => Box::pin(inner.run(inv)).await,
            },
        }
    }
}

/// A user operation composed with an ordered middleware stack.
///
/// The first middleware added is the outermost wrapper: a stack of
/// `[retry, timeout]` retries whole timed-out attempts.
pub struct Hooks<T> {
    middlewares: Vec<Arc<dyn Middleware<T>>>,
    operation: OperationFn<T>,
}

impl<T> Hooks<T>
where
    T: Send + 'static,
{
    /// Wrap an async operation.
    pub fn new<F, Fut>(operation: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AsyncError>> + Send + 'static,
    {
        Self {
            middlewares: Vec::new(),
            operation: Arc::new(move |inv| Box::pin(operation(inv))),
        }
    }

    /// Wrap an already-erased operation.
    pub fn from_operation(operation: OperationFn<T>) -> Self {
        Self {
            middlewares: Vec::new(),
            operation,
        }
    }

    /// Append a middleware inside the ones already added.
    pub fn pipe<M>(mut self, middleware: M) -> Self
    where
        M: Middleware<T> + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Append a shared middleware inside the ones already added.
    pub fn pipe_shared(mut self, middleware: Arc<dyn Middleware<T>>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Invoke with a fresh root scope.
    pub async fn invoke(&self) -> Result<T, AsyncError> {
        self.invoke_with(Invocation::root()).await
    }

    /// Invoke with a caller-provided invocation (existing scope and
    /// context).
    pub async fn invoke_with(&self, inv: Invocation) -> Result<T, AsyncError> {
        Next::new(&self.middlewares, &self.operation).run(&inv).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Tag {
        label: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Middleware<u32> for Tag {
        async fn handle(&self, inv: &Invocation, next: Next<'_, u32>) -> Result<u32, AsyncError> {
            self.order.lock().push(self.label);
            next.run(inv).await
        }
    }

    #[tokio::test]
    async fn test_outer_to_inner_composition() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let hooks = Hooks::new(|_| async { Ok(7u32) })
            .pipe(Tag {
                label: "a",
                order: Arc::clone(&order),
            })
            .pipe(Tag {
                label: "b",
                order: Arc::clone(&order),
            })
            .pipe(Tag {
                label: "c",
                order: Arc::clone(&order),
            });

        let value = hooks.invoke().await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_operation_receives_invocation_context() {
        let hooks = Hooks::new(|inv: Invocation| async move {
            Ok(inv.get_value("n").and_then(|v| v.as_u64()).unwrap_or(0) as u32)
        });

        let inv = Invocation::root();
        inv.set_value("n", serde_json::json!(41));
        assert_eq!(hooks.invoke_with(inv).await.unwrap(), 41);
    }

    #[tokio::test]
    async fn test_next_is_re_runnable() {
        struct Twice;

        #[async_trait]
        impl Middleware<u32> for Twice {
            async fn handle(
                &self,
                inv: &Invocation,
                next: Next<'_, u32>,
            ) -> Result<u32, AsyncError> {
                let first = next.run(inv).await?;
                let second = next.run(inv).await?;
                Ok(first + second)
            }
        }

        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let hooks = Hooks::new(move |_| {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(5u32)
            }
        })
        .pipe(Twice);

        assert_eq!(hooks.invoke().await.unwrap(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
