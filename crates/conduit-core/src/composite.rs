//! Aggregate of several handles observed as one.
//!
//! Connectors hand back one handle for "connect complete and handshake
//! complete" on start, and one for "channel closed and every pool drained"
//! on stop.

use crate::error::HandleError;
use crate::handle::{AsyncHandle, SharedHandle};
use std::fmt;
use std::time::{Duration, Instant};

/// Ordered bundle of handles.
///
/// Done when every constituent is done. Waiting is fail-fast: the first
/// constituent error is returned without waiting on the ones after it.
pub struct CompositeHandle {
    handles: Vec<SharedHandle>,
}

impl CompositeHandle {
    /// Bundle `handles` in order.
    pub fn new(handles: Vec<SharedHandle>) -> Self {
        Self { handles }
    }

    /// Number of constituents
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the composite has no constituents (and is trivially done)
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Constituents in order
    pub fn handles(&self) -> &[SharedHandle] {
        &self.handles
    }
}

impl FromIterator<SharedHandle> for CompositeHandle {
    fn from_iter<I: IntoIterator<Item = SharedHandle>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl AsyncHandle for CompositeHandle {
    /// Cancel every constituent; `true` only if each one reported success.
    fn cancel(&self) -> bool {
        self.handles
            .iter()
            .fold(true, |all, handle| handle.cancel() && all)
    }

    fn is_done(&self) -> bool {
        self.handles.iter().all(|handle| handle.is_done())
    }

    /// Any constituent cancelled
    fn is_cancelled(&self) -> bool {
        self.handles.iter().any(|handle| handle.is_cancelled())
    }

    fn wait(&self) -> Result<(), HandleError> {
        for handle in &self.handles {
            handle.wait()?;
        }
        Ok(())
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<(), HandleError> {
        let mut remaining = timeout;
        for handle in &self.handles {
            let started = Instant::now();
            handle.wait_timeout(remaining)?;
            remaining = remaining.saturating_sub(started.elapsed());
        }
        Ok(())
    }
}

impl fmt::Debug for CompositeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeHandle")
            .field("len", &self.handles.len())
            .field("done", &self.is_done())
            .finish()
    }
}
