//! Per-connector traffic statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Transport statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total payload bytes sent
    pub bytes_sent: u64,
    /// Total payload bytes received
    pub bytes_received: u64,
    /// Total messages sent
    pub messages_sent: u64,
    /// Total messages received
    pub messages_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors (I/O, framing, datagram security)
    pub recv_errors: u64,
}

/// Lock-free counters behind a [`TransportStats`] snapshot.
#[derive(Debug, Default)]
pub struct StatsCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl StatsCounters {
    /// Zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful receive
    pub fn record_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send error
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a receive error
    pub fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values
    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_stats() {
        let stats = StatsCounters::new();
        assert_eq!(stats.snapshot(), TransportStats::default());

        stats.record_send(100);
        stats.record_recv(200);
        stats.record_send_error();
        stats.record_recv_error();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_sent, 100);
        assert_eq!(snapshot.messages_sent, 1);
        assert_eq!(snapshot.bytes_received, 200);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.send_errors, 1);
        assert_eq!(snapshot.recv_errors, 1);
    }

    #[test]
    fn test_transport_stats_multiple_operations() {
        let stats = StatsCounters::new();

        for i in 1..=10 {
            stats.record_send(100);
            assert_eq!(stats.snapshot().messages_sent, i);
            assert_eq!(stats.snapshot().bytes_sent, i * 100);
        }

        for i in 1..=5 {
            stats.record_recv(50);
            assert_eq!(stats.snapshot().messages_received, i);
            assert_eq!(stats.snapshot().bytes_received, i * 50);
        }
    }
}
