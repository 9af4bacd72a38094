//! Placeholder handle bound to its real operation later.
//!
//! A connector knows at `start()` that a TLS handshake will follow the TCP
//! connect, but the handshake handle only exists once the transport is up,
//! on a runtime thread. [`DeferredHandle`] is handed out eagerly and bound
//! once the real handle materializes.

use crate::error::HandleError;
use crate::handle::{AsyncHandle, SharedHandle};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Slot {
    target: Option<SharedHandle>,
    cancelled: bool,
}

/// Handle whose target is supplied after creation.
///
/// Bound at most once. Cancelling before the bind is purely local: waiters
/// wake with [`HandleError::Cancelled`] and no target is ever consulted. A
/// target offered after such a cancel is cancelled and not stored.
#[derive(Default)]
pub struct DeferredHandle {
    slot: Mutex<Slot>,
    bound: Condvar,
}

impl DeferredHandle {
    /// Unbound handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the real operation.
    ///
    /// Returns `true` if this call performed the bind. Later calls, and calls
    /// after a local cancel, return `false` and leave the first binding in
    /// place.
    pub fn bind(&self, target: SharedHandle) -> bool {
        let mut slot = self.slot.lock();
        if slot.target.is_some() {
            return false;
        }
        if slot.cancelled {
            drop(slot);
            target.cancel();
            return false;
        }
        slot.target = Some(target);
        self.bound.notify_all();
        true
    }

    /// Whether a target has been bound
    pub fn is_bound(&self) -> bool {
        self.slot.lock().target.is_some()
    }

    fn target(&self) -> Option<SharedHandle> {
        self.slot.lock().target.clone()
    }

    /// Block until bound or cancelled, up to an optional deadline.
    fn await_target(&self, deadline: Option<Instant>) -> Result<SharedHandle, HandleError> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(target) = &slot.target {
                return Ok(target.clone());
            }
            if slot.cancelled {
                return Err(HandleError::Cancelled);
            }
            match deadline {
                Some(deadline) => {
                    if self.bound.wait_until(&mut slot, deadline).timed_out()
                        && slot.target.is_none()
                        && !slot.cancelled
                    {
                        return Err(HandleError::Timeout);
                    }
                }
                None => self.bound.wait(&mut slot),
            }
        }
    }
}

impl AsyncHandle for DeferredHandle {
    fn cancel(&self) -> bool {
        let target = {
            let mut slot = self.slot.lock();
            match &slot.target {
                Some(target) => target.clone(),
                None if slot.cancelled => return false,
                None => {
                    slot.cancelled = true;
                    self.bound.notify_all();
                    return true;
                }
            }
        };
        target.cancel()
    }

    fn is_done(&self) -> bool {
        let slot = self.slot.lock();
        match &slot.target {
            Some(target) => target.is_done(),
            None => slot.cancelled,
        }
    }

    fn is_cancelled(&self) -> bool {
        let slot = self.slot.lock();
        match &slot.target {
            Some(target) => target.is_cancelled(),
            None => slot.cancelled,
        }
    }

    fn wait(&self) -> Result<(), HandleError> {
        self.await_target(None)?.wait()
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<(), HandleError> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.wait();
        };
        let target = self.await_target(Some(deadline))?;
        target.wait_timeout(deadline.saturating_duration_since(Instant::now()))
    }
}

impl fmt::Debug for DeferredHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("DeferredHandle")
            .field("bound", &slot.target.is_some())
            .field("cancelled", &slot.cancelled)
            .finish()
    }
}
