//! Thread-safe start/stop decorator.
//!
//! A server shared between components may see `start()` and `stop()` from
//! several threads. [`ThreadSafeConnector`] serializes them under one lock:
//! the first `start()` starts the connector and every later one returns the
//! same handle until `stop()`, or until that handle settles with a failure.
//! The lock covers only the check-and-set and the non-blocking call behind
//! it, never a wait.

use crate::connector::{Connector, MessageReceiver, StatefulConnector};
use crate::error::TransportError;
use conduit_core::{
    AsyncHandle, CompletionHandle, ConnectionState, ConnectionStateListener, Endpoint, RawMessage,
    SharedHandle,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Connector whose `start()`/`stop()` may be called concurrently.
pub struct ThreadSafeConnector<C> {
    inner: C,
    started: Mutex<Option<SharedHandle>>,
}

impl<C: Connector> ThreadSafeConnector<C> {
    /// Wrap `inner`
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            started: Mutex::new(None),
        }
    }

    /// Wrapped connector
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Whether `start()` has been called without a matching `stop()`
    pub fn is_started(&self) -> bool {
        self.started.lock().is_some()
    }
}

impl<C: Connector> Connector for ThreadSafeConnector<C> {
    /// Start once; later calls return the first call's handle unless it
    /// has already failed, in which case the connector is started again.
    fn start(&self) -> Result<SharedHandle, TransportError> {
        let mut started = self.started.lock();
        if let Some(handle) = started.as_ref() {
            if !has_failed(handle.as_ref()) {
                debug!("Already started, returning existing handle");
                return Ok(Arc::clone(handle));
            }
            debug!("Previous start failed, starting again");
            started.take();
        }
        let handle = self.inner.start()?;
        *started = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Stop once; later calls return a completed handle.
    fn stop(&self) -> SharedHandle {
        let mut started = self.started.lock();
        if started.take().is_some() {
            self.inner.stop()
        } else {
            CompletionHandle::completed()
        }
    }

    fn destroy(&self) {
        self.stop();
        self.inner.destroy();
    }

    fn send(&self, message: RawMessage) -> Result<SharedHandle, TransportError> {
        self.inner.send(message)
    }

    fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) {
        self.inner.set_receiver(receiver)
    }

    fn local_address(&self) -> Endpoint {
        self.inner.local_address()
    }
}

/// Settled without success; never blocks.
fn has_failed(handle: &dyn AsyncHandle) -> bool {
    handle.is_done() && handle.wait_timeout(Duration::ZERO).is_err()
}

impl<C: StatefulConnector> StatefulConnector for ThreadSafeConnector<C> {
    fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    fn set_state_listener(&self, listener: Arc<dyn ConnectionStateListener>) {
        self.inner.set_state_listener(listener)
    }
}
