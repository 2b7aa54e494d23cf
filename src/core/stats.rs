//! Forwarding counters
//!
//! Lock-free counters shared between the accept loop and session tasks.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ForwardStats {
    accepted: AtomicU64,
    dial_failures: AtomicU64,
    active_sessions: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    datagrams: AtomicU64,
    datagrams_truncated: AtomicU64,
}

/// Point-in-time copy of [`ForwardStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub dial_failures: u64,
    pub active_sessions: u64,
    /// Client -> remote bytes (TCP) or forwarded datagram bytes (UDP)
    pub bytes_up: u64,
    /// Remote -> client bytes
    pub bytes_down: u64,
    pub datagrams: u64,
    pub datagrams_truncated: u64,
}

impl ForwardStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        // Never wraps below zero even if a close is recorded twice
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_traffic(&self, up: u64, down: u64) {
        self.bytes_up.fetch_add(up, Ordering::Relaxed);
        self.bytes_down.fetch_add(down, Ordering::Relaxed);
    }

    pub fn record_datagram(&self, bytes: usize, truncated: bool) {
        self.datagrams.fetch_add(1, Ordering::Relaxed);
        self.bytes_up.fetch_add(bytes as u64, Ordering::Relaxed);
        if truncated {
            self.datagrams_truncated.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            datagrams: self.datagrams.load(Ordering::Relaxed),
            datagrams_truncated: self.datagrams_truncated.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_session_counters() {
        let stats = ForwardStats::new();
        stats.record_accept();
        stats.record_accept();
        stats.record_dial_failure();
        stats.session_opened();
        stats.record_traffic(10, 20);

        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.dial_failures, 1);
        assert_eq!(snap.active_sessions, 1);
        assert_eq!(snap.bytes_up, 10);
        assert_eq!(snap.bytes_down, 20);

        stats.session_closed();
        assert_eq!(stats.snapshot().active_sessions, 0);
    }

    #[test]
    fn test_session_closed_saturates() {
        let stats = ForwardStats::new();
        stats.session_closed();
        assert_eq!(stats.snapshot().active_sessions, 0);
    }

    #[test]
    fn test_datagram_counters() {
        let stats = ForwardStats::new();
        stats.record_datagram(100, false);
        stats.record_datagram(512, true);

        let snap = stats.snapshot();
        assert_eq!(snap.datagrams, 2);
        assert_eq!(snap.datagrams_truncated, 1);
        assert_eq!(snap.bytes_up, 612);
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = Arc::new(ForwardStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_accept();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot().accepted, 8000);
    }
}
