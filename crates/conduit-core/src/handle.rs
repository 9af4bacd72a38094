//! Async operation handles.
//!
//! Every connector operation that finishes later (connect, bind, TLS
//! handshake, write, shutdown) is represented by an [`AsyncHandle`]. The
//! leaf implementation is [`CompletionHandle`], settled exactly once by the
//! task performing the operation. [`DeferredHandle`](crate::DeferredHandle)
//! and [`CompositeHandle`](crate::CompositeHandle) build on top of it.
//!
//! Waiting blocks the calling thread; connectors run their I/O on their
//! own runtimes, so a caller waiting on a handle never stalls the work that
//! settles it.

use crate::error::HandleError;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Observable result of an operation that completes asynchronously.
pub trait AsyncHandle: Send + Sync {
    /// Attempt to cancel the operation.
    ///
    /// Returns `true` if this call cancelled it.
    fn cancel(&self) -> bool;

    /// Whether the operation has finished (successfully, with a failure, or
    /// by cancellation).
    fn is_done(&self) -> bool;

    /// Whether the operation was cancelled.
    fn is_cancelled(&self) -> bool;

    /// Block until the operation finishes.
    ///
    /// # Errors
    ///
    /// [`HandleError::Cancelled`] if cancelled, [`HandleError::Failed`] if
    /// the operation failed.
    fn wait(&self) -> Result<(), HandleError>;

    /// Block for at most `timeout`.
    ///
    /// # Errors
    ///
    /// As [`AsyncHandle::wait`], plus [`HandleError::Timeout`] when the
    /// budget runs out first.
    fn wait_timeout(&self, timeout: Duration) -> Result<(), HandleError>;
}

/// Shared, type-erased handle
pub type SharedHandle = Arc<dyn AsyncHandle>;

/// Settled state of a [`CompletionHandle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Not finished yet
    Pending,
    /// Finished successfully
    Succeeded,
    /// Finished with a failure
    Failed(String),
    /// Cancelled before finishing
    Cancelled,
}

impl Outcome {
    fn as_result(&self) -> Option<Result<(), HandleError>> {
        match self {
            Self::Pending => None,
            Self::Succeeded => Some(Ok(())),
            Self::Failed(reason) => Some(Err(HandleError::Failed(reason.clone()))),
            Self::Cancelled => Some(Err(HandleError::Cancelled)),
        }
    }
}

type CancelHook = Box<dyn FnOnce() + Send>;

/// A handle settled exactly once by whoever performs the operation.
///
/// The first of [`complete`](Self::complete), [`fail`](Self::fail) or
/// [`cancel`](AsyncHandle::cancel) wins; later calls return `false`.
pub struct CompletionHandle {
    outcome: Mutex<Outcome>,
    settled: Condvar,
    cancel_hook: Mutex<Option<CancelHook>>,
}

impl CompletionHandle {
    /// Pending handle.
    pub fn pending() -> Arc<Self> {
        Arc::new(Self::with_outcome(Outcome::Pending))
    }

    /// Handle that has already succeeded.
    pub fn completed() -> Arc<Self> {
        Arc::new(Self::with_outcome(Outcome::Succeeded))
    }

    /// Handle that has already failed.
    pub fn failed(reason: impl fmt::Display) -> Arc<Self> {
        Arc::new(Self::with_outcome(Outcome::Failed(reason.to_string())))
    }

    fn with_outcome(outcome: Outcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            settled: Condvar::new(),
            cancel_hook: Mutex::new(None),
        }
    }

    /// Mark the operation successful.
    pub fn complete(&self) -> bool {
        self.settle(Outcome::Succeeded)
    }

    /// Mark the operation failed.
    pub fn fail(&self, reason: impl fmt::Display) -> bool {
        self.settle(Outcome::Failed(reason.to_string()))
    }

    /// Settle from a `Result`.
    pub fn settle_with<E: fmt::Display>(&self, result: Result<(), E>) -> bool {
        match result {
            Ok(()) => self.complete(),
            Err(e) => self.fail(e),
        }
    }

    /// Current outcome.
    pub fn outcome(&self) -> Outcome {
        self.outcome.lock().clone()
    }

    /// Register work to run if the handle is cancelled (e.g. aborting the
    /// task behind it).
    ///
    /// Runs immediately if the handle is already cancelled; dropped if the
    /// handle is already settled otherwise.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        match *self.outcome.lock() {
            Outcome::Pending => {}
            Outcome::Cancelled => {
                hook();
                return;
            }
            _ => return,
        }
        *self.cancel_hook.lock() = Some(Box::new(hook));

        // Cancelled between the check and the store
        if *self.outcome.lock() == Outcome::Cancelled {
            if let Some(hook) = self.cancel_hook.lock().take() {
                hook();
            }
        }
    }

    fn settle(&self, outcome: Outcome) -> bool {
        let cancelled = outcome == Outcome::Cancelled;
        {
            let mut current = self.outcome.lock();
            if *current != Outcome::Pending {
                return false;
            }
            *current = outcome;
            self.settled.notify_all();
        }

        let hook = self.cancel_hook.lock().take();
        if cancelled {
            if let Some(hook) = hook {
                hook();
            }
        }
        true
    }
}

impl AsyncHandle for CompletionHandle {
    fn cancel(&self) -> bool {
        self.settle(Outcome::Cancelled)
    }

    fn is_done(&self) -> bool {
        *self.outcome.lock() != Outcome::Pending
    }

    fn is_cancelled(&self) -> bool {
        *self.outcome.lock() == Outcome::Cancelled
    }

    fn wait(&self) -> Result<(), HandleError> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_result() {
                return result;
            }
            self.settled.wait(&mut outcome);
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<(), HandleError> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.wait();
        };

        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_result() {
                return result;
            }
            if self.settled.wait_until(&mut outcome, deadline).timed_out() {
                return outcome.as_result().unwrap_or(Err(HandleError::Timeout));
            }
        }
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Guard that completes a handle when dropped.
///
/// Held by a task for its whole lifetime so the handle settles however the
/// task ends: normal return, error, abort, or runtime shutdown.
#[derive(Debug)]
pub struct CompleteOnDrop(Arc<CompletionHandle>);

impl CompleteOnDrop {
    /// Guard `handle`.
    pub fn new(handle: Arc<CompletionHandle>) -> Self {
        Self(handle)
    }
}

impl Drop for CompleteOnDrop {
    fn drop(&mut self) {
        self.0.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn test_completed_handle() {
        let handle = CompletionHandle::completed();
        assert!(handle.is_done());
        assert!(!handle.is_cancelled());
        assert_eq!(handle.wait(), Ok(()));
        assert_eq!(handle.wait_timeout(Duration::ZERO), Ok(()));
        assert!(!handle.cancel());
    }

    #[test]
    fn test_first_settlement_wins() {
        let handle = CompletionHandle::pending();
        assert!(handle.fail("refused"));
        assert!(!handle.complete());
        assert!(!handle.cancel());
        assert_eq!(handle.wait(), Err(HandleError::Failed("refused".into())));
    }

    #[test]
    fn test_wait_wakes_on_completion() {
        let handle = CompletionHandle::pending();
        let settler = Arc::clone(&handle);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            settler.complete();
        });
        assert_eq!(handle.wait(), Ok(()));
        t.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let handle = CompletionHandle::pending();
        let start = Instant::now();
        assert_eq!(
            handle.wait_timeout(Duration::from_millis(30)),
            Err(HandleError::Timeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(!handle.is_done());
    }

    #[test]
    fn test_cancel_runs_hook_once() {
        let handle = CompletionHandle::pending();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        handle.on_cancel(move || flag.store(true, Ordering::SeqCst));

        assert!(handle.cancel());
        assert!(fired.load(Ordering::SeqCst));
        assert!(handle.is_cancelled());
        assert!(handle.is_done());
        assert_eq!(handle.wait(), Err(HandleError::Cancelled));
        assert!(!handle.cancel());
    }

    #[test]
    fn test_hook_after_cancel_runs_immediately() {
        let handle = CompletionHandle::pending();
        handle.cancel();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        handle.on_cancel(move || flag.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_hook_dropped_on_completion() {
        let handle = CompletionHandle::pending();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        handle.on_cancel(move || flag.store(true, Ordering::SeqCst));
        handle.complete();
        handle.cancel();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_complete_on_drop() {
        let handle = CompletionHandle::pending();
        {
            let _guard = CompleteOnDrop::new(Arc::clone(&handle));
            assert!(!handle.is_done());
        }
        assert_eq!(handle.outcome(), Outcome::Succeeded);
    }
}
