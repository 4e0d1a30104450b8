//! Shared, cancellable handle to a value that settles later.
//!
//! A [`Deferred`] is what the store hands around wherever something is
//! "pending": the future behind an async cell mutation, the result of an
//! async computed value, or an action that returned a future. Clones share one
//! underlying future, compare equal by identity, and expose the settled
//! outcome through [`result`](Deferred::result), [`error`](Deferred::error)
//! and [`is_loading`](Deferred::is_loading) without having to be awaited.

use crate::error::{Result, StoreError};
use futures::future::{AbortHandle, Abortable, Aborted, LocalBoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

struct DeferredInner {
    abort: AbortHandle,
}

/// Cheaply cloneable, identity-comparable future of a [`Value`]
///
/// Awaiting a clone drives the shared future. Cancelling any clone cancels all
/// of them: the future is dropped at its next poll and every waiter resolves
/// to `Err(StoreError::Cancelled)`. Cancellation does not undo work the
/// future already started, it only suppresses the outcome.
///
/// # Example
/// ```ignore
/// let later = Deferred::new(async { Ok(json!(1)) });
/// let same = later.clone();
/// assert!(later.ptr_eq(&same));
/// assert_eq!(same.await.unwrap(), json!(1));
/// assert_eq!(later.result(), Some(json!(1)));
/// ```
#[derive(Clone)]
pub struct Deferred {
    inner: Rc<DeferredInner>,
    future: Shared<LocalBoxFuture<'static, Result<Value>>>,
}

impl Deferred {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value>> + 'static,
    {
        let (abort, registration) = AbortHandle::new_pair();
        let future = Abortable::new(future, registration)
            .map(|outcome| match outcome {
                Ok(result) => result,
                Err(Aborted) => Err(StoreError::Cancelled),
            })
            .boxed_local()
            .shared();
        Deferred {
            inner: Rc::new(DeferredInner { abort }),
            future,
        }
    }

    /// An already settled success
    pub fn resolved(value: Value) -> Self {
        Self::settled(Ok(value))
    }

    /// An already settled failure
    pub fn rejected(error: StoreError) -> Self {
        Self::settled(Err(error))
    }

    fn settled(result: Result<Value>) -> Self {
        let deferred = Self::new(std::future::ready(result));
        let _ = deferred.future.clone().now_or_never();
        deferred
    }

    /// Resolve with `null` once `duration` has elapsed
    ///
    /// The timer is created on first poll, so the deferred itself can be
    /// built outside of a runtime.
    pub fn delay(duration: Duration) -> Self {
        Self::new(async move {
            tokio::time::sleep(duration).await;
            Ok(Value::Null)
        })
    }

    /// Cancel the future for every clone; a no-op once settled
    pub fn cancel(&self) {
        if self.future.peek().is_none() {
            self.inner.abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self.future.peek() {
            Some(outcome) => matches!(outcome, Err(StoreError::Cancelled)),
            None => self.inner.abort.is_aborted(),
        }
    }

    /// Identity comparison: true if both handles share one future
    pub fn ptr_eq(&self, other: &Deferred) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Settled outcome, `None` while still running
    pub fn peek(&self) -> Option<Result<Value>> {
        match self.future.peek() {
            Some(outcome) => Some(outcome.clone()),
            None if self.inner.abort.is_aborted() => Some(Err(StoreError::Cancelled)),
            None => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.peek().is_none()
    }

    pub fn result(&self) -> Option<Value> {
        self.peek().and_then(Result::ok)
    }

    pub fn error(&self) -> Option<StoreError> {
        self.peek().and_then(Result::err)
    }
}

impl Future for Deferred {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().future).poll(cx)
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Deferred");
        debug.field("id", &Rc::as_ptr(&self.inner));
        match self.peek() {
            None => debug.field("loading", &true),
            Some(Ok(value)) => debug.field("result", &value),
            Some(Err(error)) => debug.field("error", &error),
        };
        debug.finish()
    }
}
