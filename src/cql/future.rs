//! Single-assignment futures completed by the I/O side.
//!
//! An operation hands out a `CqlFuture<T>` to the caller and keeps the
//! matching `Promise<T>`. The caller may poll, block or block with a
//! timeout; the promise completes it exactly once.
//!
//! Dropping a `CqlFuture` while it is still pending only releases the
//! caller's interest. The operation keeps running and nothing blocks.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::error::{CqlError, CqlResult, FutureError};
use super::result::ResultSet;
use super::session::Session;
use super::statement::Prepared;

/// Completes with the connected session.
pub type SessionFuture = CqlFuture<Session>;
/// Completes with the prepared statement.
pub type PrepareFuture = CqlFuture<Arc<Prepared>>;
/// Completes with the result of a query, execute or batch.
pub type ResultFuture = CqlFuture<ResultSet>;
/// Completes once the session is closed.
pub type ShutdownFuture = CqlFuture<()>;

struct Inner<T> {
    outcome: OnceCell<Result<T, FutureError>>,
    lock: Mutex<()>,
    ready: Condvar,
}

impl<T> Inner<T> {
    fn new() -> Self {
        Self {
            outcome: OnceCell::new(),
            lock: Mutex::new(()),
            ready: Condvar::new(),
        }
    }

    /// Publish the outcome and wake every waiter.
    fn complete(&self, outcome: Result<T, FutureError>) -> CqlResult<()> {
        if self.outcome.set(outcome).is_err() {
            warn!("Rejected second completion of an already completed future");
            return Err(CqlError::AlreadyCompleted);
        }
        // Waiters check the cell under the lock, so notifying under it
        // cannot race with a waiter about to sleep.
        let _guard = self.lock.lock();
        self.ready.notify_all();
        Ok(())
    }
}

// ============================================================================
// Future (consumer side)
// ============================================================================

/// The caller's view of an asynchronous operation.
///
/// Cloning is cheap; every clone observes the same outcome.
pub struct CqlFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CqlFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> CqlFuture<T> {
    /// Create a pending future and the promise that completes it.
    pub fn pending() -> (Promise<T>, CqlFuture<T>) {
        let inner = Arc::new(Inner::new());
        let promise = Promise {
            inner: Arc::clone(&inner),
        };
        (promise, CqlFuture { inner })
    }

    /// A future that is already completed successfully.
    pub fn ready(value: T) -> Self {
        Self::completed(Ok(value))
    }

    /// A future that is already completed with an error.
    pub fn failed(error: impl Into<FutureError>) -> Self {
        Self::completed(Err(error.into()))
    }

    fn completed(outcome: Result<T, FutureError>) -> Self {
        let inner = Inner::new();
        // A fresh cell is always empty
        let _ = inner.outcome.set(outcome);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Non-blocking completion check.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    /// Block until the future completes and return its outcome.
    pub fn wait(&self) -> &Result<T, FutureError> {
        if let Some(outcome) = self.inner.outcome.get() {
            return outcome;
        }

        let mut guard = self.inner.lock.lock();
        loop {
            if let Some(outcome) = self.inner.outcome.get() {
                return outcome;
            }
            self.inner.ready.wait(&mut guard);
        }
    }

    /// Block for at most `timeout`. Returns whether the future is ready.
    ///
    /// Timing out does not cancel the operation.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        if self.is_ready() {
            return true;
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        loop {
            if self.is_ready() {
                return true;
            }
            if self.inner.ready.wait_until(&mut guard, deadline).timed_out() {
                return self.is_ready();
            }
        }
    }

    /// Wait, then borrow the outcome.
    pub fn result(&self) -> Result<&T, &FutureError> {
        self.wait().as_ref()
    }

    /// Wait, then return the payload if the operation succeeded.
    pub fn payload(&self) -> Option<&T> {
        self.wait().as_ref().ok()
    }

    /// Wait, then return the error if the operation failed.
    pub fn error(&self) -> Option<&FutureError> {
        self.wait().as_ref().err()
    }
}

impl<T: Clone> CqlFuture<T> {
    /// Wait, then return an owned copy of the outcome.
    pub fn get(&self) -> Result<T, FutureError> {
        self.wait().clone()
    }
}

impl<T> fmt::Debug for CqlFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.outcome.get() {
            None => "pending",
            Some(Ok(_)) => "ready",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("CqlFuture").field("state", &state).finish()
    }
}

// ============================================================================
// Promise (producer side)
// ============================================================================

/// The I/O side's handle for completing a future.
///
/// Dropping a promise that was never completed resolves its future with
/// `StatusCode::LibRequestAbandoned`.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Promise<T> {
    /// Complete the future. Only the first completion takes effect; later
    /// attempts fail with `CqlError::AlreadyCompleted`.
    pub fn complete(&self, outcome: Result<T, FutureError>) -> CqlResult<()> {
        self.inner.complete(outcome)
    }

    pub fn set_value(&self, value: T) -> CqlResult<()> {
        self.complete(Ok(value))
    }

    pub fn set_error(&self, error: impl Into<FutureError>) -> CqlResult<()> {
        self.complete(Err(error.into()))
    }

    /// Complete from a driver result, converting the error side.
    pub fn complete_with(&self, result: CqlResult<T>) -> CqlResult<()> {
        self.complete(result.map_err(FutureError::from))
    }

    pub fn is_completed(&self) -> bool {
        self.inner.outcome.get().is_some()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.is_completed() {
            debug!("Promise dropped before completion, abandoning request");
            let _ = self.inner.complete(Err(FutureError::abandoned()));
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::error::{ErrorSource, StatusCode};
    use std::thread;

    #[test]
    fn test_ready_and_failed_constructors() {
        let ok = CqlFuture::ready(5);
        assert!(ok.is_ready());
        assert_eq!(ok.payload(), Some(&5));
        assert!(ok.error().is_none());

        let failed: CqlFuture<i32> = CqlFuture::failed(CqlError::UnboundParameter(0));
        assert!(failed.is_ready());
        let err = failed.error().unwrap();
        assert_eq!(err.code, StatusCode::LibUnboundParameter);
        assert_eq!(err.source, ErrorSource::Lib);
        assert!(failed.payload().is_none());
    }

    #[test]
    fn test_second_completion_is_rejected() {
        let (promise, future) = CqlFuture::pending();
        assert!(!future.is_ready());

        promise.set_value("first").unwrap();
        assert!(matches!(
            promise.set_value("second"),
            Err(CqlError::AlreadyCompleted)
        ));
        assert!(promise.set_error(CqlError::Timeout).is_err());

        assert_eq!(future.payload(), Some(&"first"));
    }

    #[test]
    fn test_concurrent_completion_single_winner() {
        let (promise, future) = CqlFuture::<usize>::pending();
        let promise = Arc::new(promise);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let promise = Arc::clone(&promise);
                thread::spawn(move || promise.set_value(i).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert!(future.payload().is_some());
    }

    #[test]
    fn test_completion_visible_to_all_waiters() {
        let (promise, future) = CqlFuture::pending();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let future = future.clone();
                thread::spawn(move || *future.payload().unwrap())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        promise.set_value(99u32).unwrap();

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), 99);
        }
    }

    #[test]
    fn test_wait_for_times_out_then_wait_succeeds() {
        let (promise, future) = CqlFuture::pending();

        let start = Instant::now();
        assert!(!future.wait_for(Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(!future.is_ready());

        let completer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            promise.set_value(String::from("done")).unwrap();
        });

        assert_eq!(future.result().unwrap(), "done");
        assert!(future.wait_for(Duration::from_millis(1)));
        completer.join().unwrap();
    }

    #[test]
    fn test_dropped_promise_abandons_future() {
        let (promise, future) = CqlFuture::<()>::pending();
        drop(promise);

        let err = future.error().unwrap();
        assert_eq!(err.code, StatusCode::LibRequestAbandoned);
    }

    #[test]
    fn test_dropping_pending_future_does_not_block_completion() {
        let (promise, future) = CqlFuture::pending();
        drop(future);
        promise.set_value(1u8).unwrap();
        assert!(promise.is_completed());
    }

    #[test]
    fn test_server_error_source() {
        let (promise, future) = CqlFuture::<()>::pending();
        promise
            .complete_with(Err(CqlError::Server {
                code: 0x2200,
                message: "unconfigured table".to_string(),
            }))
            .unwrap();

        let err = future.error().unwrap();
        assert_eq!(err.source, ErrorSource::Server);
        assert_eq!(err.code, StatusCode::ServerInvalid);
        assert!(future.get().is_err());
    }
}
