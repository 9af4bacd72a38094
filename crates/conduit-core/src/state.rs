//! Connection lifecycle states and listener notification.
//!
//! # State machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected                       (plain TCP)
//! Disconnected -> Connecting -> Connected -> TlsHandshakeStarted -> ConnectedSecure
//!                                                               \-> TlsHandshakeFailed
//! any non-failed state -> Disconnecting -> Disconnected          (stop)
//! ```
//!
//! Servers additionally report `NewIncomingConnect` / `NewIncomingDisconnect`
//! per remote endpoint. Those are events, not states of the listening
//! socket, and never enter the [`StateCell`].
//!
//! The cell is advisory: it is last-writer-wins and may be stale by the
//! time it is read. Nothing in this crate or its users should gate a
//! decision on it; use the listener for ordered observation.

use crate::endpoint::Endpoint;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Point in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// No transport
    Disconnected = 0,
    /// Connect or bind requested
    Connecting = 1,
    /// Transport established (terminal success without TLS)
    Connected = 2,
    /// Transport established and TLS handshake complete
    ConnectedSecure = 3,
    /// Graceful shutdown in progress
    Disconnecting = 4,
    /// TLS handshake in progress
    TlsHandshakeStarted = 5,
    /// TLS handshake failed; terminal for this attempt
    TlsHandshakeFailed = 6,
    /// A remote peer's transport was accepted (server, per remote)
    NewIncomingConnect = 7,
    /// A remote peer's transport closed (server, per remote)
    NewIncomingDisconnect = 8,
}

impl ConnectionState {
    /// Decode the `repr(u8)` value.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::ConnectedSecure,
            4 => Self::Disconnecting,
            5 => Self::TlsHandshakeStarted,
            6 => Self::TlsHandshakeFailed,
            7 => Self::NewIncomingConnect,
            8 => Self::NewIncomingDisconnect,
            _ => return None,
        })
    }

    /// Per-remote server event rather than a connector state
    pub fn is_remote_event(self) -> bool {
        matches!(self, Self::NewIncomingConnect | Self::NewIncomingDisconnect)
    }

    /// Failed attempt
    pub fn is_failed(self) -> bool {
        self == Self::TlsHandshakeFailed
    }

    /// Transport usable for data
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::ConnectedSecure)
    }

    /// Whether `self -> next` is an expected connector transition.
    ///
    /// Connect failures and peer closes go straight to `Disconnected`; a
    /// failed handshake is left through `Disconnected` on `stop()`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;

        if self.is_remote_event() || next.is_remote_event() {
            return false;
        }
        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connected | TlsHandshakeFailed | Disconnected) => true,
            (Connected, TlsHandshakeStarted | Disconnected) => true,
            (TlsHandshakeStarted, ConnectedSecure | TlsHandshakeFailed) => true,
            (ConnectedSecure, Disconnected) => true,
            (TlsHandshakeFailed, Disconnected) => true,
            (Disconnecting, Disconnected) => true,
            (from, Disconnecting) => {
                !from.is_failed() && from != Disconnected && from != Disconnecting
            }
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::ConnectedSecure => "CONNECTED_SECURE",
            Self::Disconnecting => "DISCONNECTING",
            Self::TlsHandshakeStarted => "TLS_HANDSHAKE_STARTED",
            Self::TlsHandshakeFailed => "TLS_HANDSHAKE_FAILED",
            Self::NewIncomingConnect => "NEW_INCOMING_CONNECT",
            Self::NewIncomingDisconnect => "NEW_INCOMING_DISCONNECT",
        };
        f.write_str(name)
    }
}

/// Immutable snapshot emitted on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    state: ConnectionState,
    endpoint: Endpoint,
}

impl ConnectionInfo {
    /// Create a snapshot.
    pub fn new(state: ConnectionState, endpoint: Endpoint) -> Self {
        Self { state, endpoint }
    }

    /// The state entered
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Remote endpoint for client and per-remote events, bound endpoint
    /// for the listening socket
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection {} --> {}", self.endpoint, self.state)
    }
}

/// Receives connection state snapshots.
pub trait ConnectionStateListener: Send + Sync {
    /// Called once per transition, in transition order for a given endpoint.
    fn state_changed(&self, info: ConnectionInfo);
}

impl<F> ConnectionStateListener for F
where
    F: Fn(ConnectionInfo) + Send + Sync,
{
    fn state_changed(&self, info: ConnectionInfo) {
        self(info)
    }
}

/// Advisory, atomically updated connector state.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Create a cell holding `state`.
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Last written state.
    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Write `state`, returning the previous value.
    pub fn swap(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
            .unwrap_or(ConnectionState::Disconnected)
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected)
    }
}

/// Single-occupant registration slot for a callback.
///
/// Registration is a point-in-time swap: the last registration wins and
/// callers see whichever occupant was present when they looked.
pub struct CallbackSlot<T: ?Sized> {
    current: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized> CallbackSlot<T> {
    /// Empty slot
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }

    /// Slot with an initial occupant
    pub fn with(callback: Option<Arc<T>>) -> Self {
        Self {
            current: RwLock::new(callback),
        }
    }

    /// Replace the occupant, returning the previous one.
    pub fn set(&self, callback: Arc<T>) -> Option<Arc<T>> {
        self.current.write().replace(callback)
    }

    /// Remove the occupant.
    pub fn clear(&self) -> Option<Arc<T>> {
        self.current.write().take()
    }

    /// Current occupant, if any.
    pub fn current(&self) -> Option<Arc<T>> {
        self.current.read().clone()
    }

    /// Whether a callback is registered
    pub fn is_set(&self) -> bool {
        self.current.read().is_some()
    }
}

impl<T: ?Sized> Default for CallbackSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for CallbackSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSlot")
            .field("is_set", &self.is_set())
            .finish()
    }
}
