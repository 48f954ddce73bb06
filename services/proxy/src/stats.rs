//! Process-wide connection counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the acceptor and every worker.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Raw TCP connections accepted.
    pub connections_accepted: AtomicU64,
    /// Inbound TLS handshakes that failed or timed out.
    pub handshakes_failed: AtomicU64,
    /// Handshaken connections placed on the admission queue.
    pub connections_admitted: AtomicU64,
    /// Connections dropped because no identity could be extracted.
    pub identity_failed: AtomicU64,
    /// Connections dropped because the directory lookup failed.
    pub resolve_failed: AtomicU64,
    /// Connections dropped because the backend could not be reached.
    pub backend_failed: AtomicU64,
    /// Sessions currently relaying.
    pub sessions_active: AtomicU64,
    /// Sessions that finished relaying.
    pub sessions_completed: AtomicU64,
    /// Bytes relayed from clients to backends.
    pub bytes_upstream: AtomicU64,
    /// Bytes relayed from backends to clients.
    pub bytes_downstream: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub handshakes_failed: u64,
    pub connections_admitted: u64,
    pub identity_failed: u64,
    pub resolve_failed: u64,
    pub backend_failed: u64,
    pub sessions_active: u64,
    pub sessions_completed: u64,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
}

impl ProxyStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            connections_admitted: self.connections_admitted.load(Ordering::Relaxed),
            identity_failed: self.identity_failed.load(Ordering::Relaxed),
            resolve_failed: self.resolve_failed.load(Ordering::Relaxed),
            backend_failed: self.backend_failed.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = ProxyStats::default();
        ProxyStats::incr(&stats.connections_accepted);
        stats.bytes_upstream.fetch_add(42, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.connections_accepted, 1);
        assert_eq!(snap.bytes_upstream, 42);
        assert_eq!(snap.sessions_completed, 0);
    }
}
