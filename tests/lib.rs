//! Shared helpers for Conduit integration tests.

use conduit_core::{ConnectionInfo, ConnectionState, ConnectionStateListener, RawMessage};
use conduit_transport::{MessageReceiver, TlsIdentity, TlsMaterial, tls::parse_certificates};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound for any single wait in a test
pub const WAIT: Duration = Duration::from_secs(10);

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Records every state notification in arrival order.
#[derive(Clone, Default)]
pub struct StateLog(Arc<Mutex<Vec<ConnectionInfo>>>);

impl StateLog {
    /// Listener appending to this log
    pub fn listener(&self) -> Arc<dyn ConnectionStateListener> {
        let log = Arc::clone(&self.0);
        Arc::new(move |info: ConnectionInfo| log.lock().push(info))
    }

    /// Recorded states
    pub fn states(&self) -> Vec<ConnectionState> {
        self.0.lock().iter().map(ConnectionInfo::state).collect()
    }

    /// Recorded notifications
    pub fn events(&self) -> Vec<ConnectionInfo> {
        self.0.lock().clone()
    }

    /// Whether `state` was ever reported
    pub fn contains(&self, state: ConnectionState) -> bool {
        self.states().contains(&state)
    }
}

/// Records every delivered message.
#[derive(Clone, Default)]
pub struct Inbox(Arc<Mutex<Vec<RawMessage>>>);

impl Inbox {
    /// Receiver appending to this inbox
    pub fn receiver(&self) -> Arc<dyn MessageReceiver> {
        let inbox = Arc::clone(&self.0);
        Arc::new(move |message: RawMessage| inbox.lock().push(message))
    }

    /// Delivered messages
    pub fn messages(&self) -> Vec<RawMessage> {
        self.0.lock().clone()
    }

    /// Delivered payloads
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.0.lock().iter().map(|m| m.payload().to_vec()).collect()
    }

    /// Number of delivered messages
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether nothing was delivered
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Server and client TLS material for a self-signed `localhost` certificate.
pub fn tls_pair() -> (TlsMaterial, TlsMaterial) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("certificate generation");
    let cert_pem = certified.cert.pem();
    let key_pem = certified.key_pair.serialize_pem();

    let identity = TlsIdentity::from_pem(cert_pem.as_bytes(), key_pem.as_bytes())
        .expect("identity from generated PEM");
    let roots = parse_certificates(cert_pem.as_bytes()).expect("roots from generated PEM");

    (
        TlsMaterial::new().with_identity(identity),
        TlsMaterial::new().with_trust_roots(roots),
    )
}
