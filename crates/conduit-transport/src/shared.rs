//! State shared between a connector and its I/O tasks.

use crate::config::{ConnectionConfig, TransportOptions};
use crate::connector::MessageReceiver;
use crate::error::TransportError;
use crate::executor::{CallbackExecutor, CallbackPool, CallbackPoolConfig, affinity_of};
use crate::stats::StatsCounters;
use conduit_core::{
    CallbackSlot, CompletionHandle, ConnectionInfo, ConnectionState, ConnectionStateListener,
    Endpoint, FrameCodec, RawMessage, StateCell,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, error, trace, warn};

/// How long a stopping connector waits for its tasks before abandoning them
pub(crate) const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Callbacks registered before a connector is built
#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    pub(crate) listener: Option<Arc<dyn ConnectionStateListener>>,
    pub(crate) receiver: Option<Arc<dyn MessageReceiver>>,
}

/// Records state transitions and forwards them to the current listener.
pub(crate) struct Notifier {
    cell: StateCell,
    listener: CallbackSlot<dyn ConnectionStateListener>,
    executor: Arc<dyn CallbackExecutor>,
}

impl Notifier {
    pub(crate) fn new(
        executor: Arc<dyn CallbackExecutor>,
        listener: Option<Arc<dyn ConnectionStateListener>>,
    ) -> Self {
        Self {
            cell: StateCell::default(),
            listener: CallbackSlot::with(listener),
            executor,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.cell.load()
    }

    pub(crate) fn set_listener(&self, listener: Arc<dyn ConnectionStateListener>) {
        self.listener.set(listener);
    }

    pub(crate) fn clear_listener(&self) {
        self.listener.clear();
    }

    /// Move the connector to `next` and notify.
    ///
    /// An unexpected transition is logged but still recorded and emitted.
    pub(crate) fn transition(&self, next: ConnectionState, endpoint: &Endpoint) {
        let previous = self.cell.swap(next);
        if previous.can_transition_to(next) {
            debug!(peer = %endpoint, "State {} -> {}", previous, next);
        } else {
            warn!(peer = %endpoint, "Unexpected state transition {} -> {}", previous, next);
        }
        self.emit(next, endpoint);
    }

    /// Notify without touching the connector state (per-remote events).
    pub(crate) fn emit(&self, state: ConnectionState, endpoint: &Endpoint) {
        let Some(listener) = self.listener.current() else {
            return;
        };
        let info = ConnectionInfo::new(state, endpoint.clone());
        let task = Box::new(move || listener.state_changed(info));
        if let Err(e) = self.executor.execute(affinity_of(endpoint), task) {
            warn!(peer = %endpoint, "Dropping {} notification: {}", state, e);
        }
    }
}

/// Everything a connector's tasks need besides the socket.
pub(crate) struct ConnectorCore {
    pub(crate) codec: FrameCodec,
    pub(crate) options: TransportOptions,
    pub(crate) io_threads: usize,
    pub(crate) executor: Arc<dyn CallbackExecutor>,
    pub(crate) receiver: CallbackSlot<dyn MessageReceiver>,
    pub(crate) notifier: Notifier,
    pub(crate) stats: StatsCounters,
    destroyed: AtomicBool,
}

impl ConnectorCore {
    /// Core for `config`, creating a private callback pool when no executor
    /// was injected.
    pub(crate) fn new(
        config: &ConnectionConfig,
        listener: Option<Arc<dyn ConnectionStateListener>>,
        receiver: Option<Arc<dyn MessageReceiver>>,
    ) -> Result<Self, TransportError> {
        let executor: Arc<dyn CallbackExecutor> = match &config.callback_executor {
            Some(executor) => Arc::clone(executor),
            None => Arc::new(CallbackPool::new(CallbackPoolConfig::default())?),
        };

        Ok(Self {
            codec: FrameCodec::new(config.framing, config.max_frame_size),
            options: config.options.clone(),
            io_threads: config.io_threads(),
            notifier: Notifier::new(Arc::clone(&executor), listener),
            receiver: CallbackSlot::with(receiver),
            executor,
            stats: StatsCounters::new(),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Hand a decoded message to the receiver on the callback executor.
    pub(crate) fn deliver(&self, message: RawMessage) {
        self.stats.record_recv(message.len());
        let Some(receiver) = self.receiver.current() else {
            trace!(peer = %message.endpoint(), "No receiver registered, dropping message");
            return;
        };
        let affinity = affinity_of(message.endpoint());
        let task = Box::new(move || receiver.receive(message));
        if let Err(e) = self.executor.execute(affinity, task) {
            warn!("Dropping inbound message: {}", e);
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<(), TransportError> {
        if self.destroyed.load(Ordering::Acquire) {
            Err(TransportError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Mark destroyed and drop the registered callbacks.
    pub(crate) fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.receiver.clear();
        self.notifier.clear_listener();
    }

    /// Multi-thread I/O runtime for this connector.
    pub(crate) fn io_runtime(&self, name: &str) -> Result<Runtime, TransportError> {
        Builder::new_multi_thread()
            .worker_threads(self.io_threads.max(1))
            .thread_name(name)
            .enable_all()
            .build()
            .map_err(TransportError::Io)
    }
}

/// Shut `runtime` down on a dedicated thread, run `then`, and settle
/// `drained`.
///
/// A runtime may not be dropped from inside an async context, and `stop()`
/// must not block, so the shutdown wait happens off the caller's thread.
pub(crate) fn drain_runtime(
    name: &str,
    runtime: Runtime,
    drained: Arc<CompletionHandle>,
    then: impl FnOnce() + Send + 'static,
) {
    let handle = Arc::clone(&drained);
    let spawned = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            runtime.shutdown_timeout(DRAIN_TIMEOUT);
            then();
            handle.complete();
        });
    if let Err(e) = spawned {
        error!("Failed to spawn {} thread: {}", name, e);
        drained.fail(e);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InlineExecutor;
    use parking_lot::Mutex;

    fn inline_config() -> ConnectionConfig {
        ConnectionConfig {
            callback_executor: Some(Arc::new(InlineExecutor)),
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn test_notifier_emits_to_current_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let notifier = Notifier::new(Arc::new(InlineExecutor), None);
        let endpoint = Endpoint::new("127.0.0.1", 7000);

        // No listener yet: recorded but not delivered
        notifier.transition(ConnectionState::Connecting, &endpoint);
        assert_eq!(notifier.state(), ConnectionState::Connecting);

        let sink = Arc::clone(&seen);
        notifier.set_listener(Arc::new(move |info: ConnectionInfo| sink.lock().push(info.state())));
        notifier.transition(ConnectionState::Connected, &endpoint);
        notifier.emit(ConnectionState::NewIncomingConnect, &endpoint);

        assert_eq!(
            *seen.lock(),
            vec![ConnectionState::Connected, ConnectionState::NewIncomingConnect]
        );
        // Per-remote events leave the connector state alone
        assert_eq!(notifier.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_unexpected_transition_still_emitted() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let notifier = Notifier::new(
            Arc::new(InlineExecutor),
            Some(Arc::new(move |info: ConnectionInfo| sink.lock().push(info.state()))),
        );
        notifier.transition(ConnectionState::ConnectedSecure, &Endpoint::new("127.0.0.1", 1));
        assert_eq!(*seen.lock(), vec![ConnectionState::ConnectedSecure]);
    }

    #[test]
    fn test_deliver_without_receiver_counts_message() {
        let core = ConnectorCore::new(&inline_config(), None, None).unwrap();
        core.deliver(RawMessage::new(&b"abc"[..], Endpoint::new("127.0.0.1", 1)));
        assert_eq!(core.stats.snapshot().messages_received, 1);
    }

    #[test]
    fn test_deliver_to_receiver() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let receiver: Arc<dyn MessageReceiver> =
            Arc::new(move |message: RawMessage| sink.lock().push(message));
        let core = ConnectorCore::new(&inline_config(), None, Some(receiver)).unwrap();

        let message = RawMessage::new(&b"payload"[..], Endpoint::new("10.0.0.1", 2));
        core.deliver(message.clone());
        assert_eq!(*seen.lock(), vec![message]);
    }

    #[test]
    fn test_drain_runtime_runs_then_and_completes() {
        use conduit_core::AsyncHandle;
        use std::sync::atomic::{AtomicBool, Ordering};

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        runtime.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let drained = CompletionHandle::pending();
        drain_runtime("conduit-test-drain", runtime, Arc::clone(&drained), move || {
            flag.store(true, Ordering::SeqCst);
        });

        // Pending tasks are cancelled rather than awaited
        assert!(drained.wait_timeout(Duration::from_secs(5)).is_ok());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_destroy_rejects_use() {
        let core = ConnectorCore::new(&inline_config(), None, None).unwrap();
        assert!(core.ensure_live().is_ok());
        core.destroy();
        assert!(matches!(core.ensure_live(), Err(TransportError::Destroyed)));
    }
}
