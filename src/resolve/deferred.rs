//! Deferred handler results with once-only settlement.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

/// How a deferred value settled: `Ok` carries the success value, `Err` the
/// rejection payload.
pub type Settlement = Result<Value, Value>;

type SettleFuture = Pin<Box<dyn Future<Output = Settlement>>>;

/// A handler result that is not available yet.
///
/// The future is polled on the handler execution context, so it does not
/// need to be `Send`.
///
/// # Examples
///
/// ```
/// use cavebridge::resolve::Deferred;
/// use serde_json::json;
///
/// let (deferred, settle) = Deferred::pending();
/// assert!(settle.resolve(json!({ "status": 201 })));
/// assert!(!settle.reject(json!("too late")));
/// # drop(deferred);
/// ```
pub struct Deferred {
    inner: SettleFuture,
}

impl Deferred {
    /// Wraps an arbitrary future.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Settlement> + 'static,
    {
        Self {
            inner: Box::pin(future),
        }
    }

    /// Creates an unsettled value and the handle that settles it.
    ///
    /// If every [`Settle`] clone is dropped without settling, the value
    /// settles as a rejection with a `null` payload.
    pub fn pending() -> (Self, Settle) {
        let (tx, rx) = oneshot::channel();
        let deferred = Self::from_future(async move { rx.await.unwrap_or(Err(Value::Null)) });
        let settle = Settle {
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (deferred, settle)
    }

    /// A value that is already resolved.
    pub fn resolved(value: Value) -> Self {
        Self::from_future(std::future::ready(Ok(value)))
    }

    /// A value that is already rejected.
    pub fn rejected(reason: Value) -> Self {
        Self::from_future(std::future::ready(Err(reason)))
    }
}

impl Future for Deferred {
    type Output = Settlement;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").finish_non_exhaustive()
    }
}

/// The success and failure continuations of a [`Deferred`].
///
/// Cloning shares the same slot. Whichever of [`resolve`](Self::resolve) or
/// [`reject`](Self::reject) runs first settles the value; every later call
/// is dropped and returns `false`. Safe to call from any thread.
#[derive(Clone)]
pub struct Settle {
    slot: Arc<Mutex<Option<oneshot::Sender<Settlement>>>>,
}

impl Settle {
    /// Settles with a success value. Returns `true` if this call won.
    pub fn resolve(&self, value: Value) -> bool {
        self.settle(Ok(value))
    }

    /// Settles with a rejection. Returns `true` if this call won.
    pub fn reject(&self, reason: Value) -> bool {
        self.settle(Err(reason))
    }

    /// Whether the value has already been settled.
    pub fn is_settled(&self) -> bool {
        self.slot.lock().is_none()
    }

    fn settle(&self, settlement: Settlement) -> bool {
        let Some(tx) = self.slot.lock().take() else {
            tracing::debug!("deferred value already settled; dropping late settlement");
            return false;
        };
        // A closed receiver means the caller stopped waiting; the first
        // firing is still the one that counts.
        let _ = tx.send(settlement);
        true
    }
}

impl fmt::Debug for Settle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settle")
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn first_resolution_wins() {
        let (deferred, settle) = Deferred::pending();
        assert!(settle.resolve(json!(1)));
        assert!(!settle.resolve(json!(2)));
        assert!(!settle.reject(json!("boom")));
        assert_eq!(deferred.await, Ok(json!(1)));
    }

    #[tokio::test]
    async fn first_rejection_wins() {
        let (deferred, settle) = Deferred::pending();
        let other = settle.clone();
        assert!(settle.reject(json!("boom")));
        assert!(!other.resolve(json!({ "status": 200 })));
        assert_eq!(deferred.await, Err(json!("boom")));
    }

    #[tokio::test]
    async fn abandoned_settles_as_rejection() {
        let (deferred, settle) = Deferred::pending();
        drop(settle);
        assert_eq!(deferred.await, Err(Value::Null));
    }

    #[tokio::test]
    async fn settles_from_another_thread() {
        let (deferred, settle) = Deferred::pending();
        std::thread::spawn(move || {
            settle.resolve(json!("later"));
        });
        assert_eq!(deferred.await, Ok(json!("later")));
    }

    #[tokio::test]
    async fn ready_constructors() {
        assert_eq!(Deferred::resolved(json!(true)).await, Ok(json!(true)));
        assert_eq!(Deferred::rejected(json!(7)).await, Err(json!(7)));
    }
}
