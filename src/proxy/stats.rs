//! Proxy session statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic proxy counters
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Sessions accepted
    accepted: AtomicU64,
    /// Sessions currently being handled
    active: AtomicU64,
    /// CONNECT tunnels established
    tunnels: AtomicU64,
    /// GET requests forwarded
    forwards: AtomicU64,
    /// Sessions answered with a structured error
    errors: AtomicU64,
    /// Sessions closed before sending a request line
    empty: AtomicU64,
    /// Sessions turned away by the connection limit
    rejected: AtomicU64,
    /// Bytes from clients to upstream
    bytes_up: AtomicU64,
    /// Bytes from upstream to clients
    bytes_down: AtomicU64,
}

impl ProxyStats {
    /// Create zeroed statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finished(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tunnel(&self, up: u64, down: u64) {
        self.tunnels.fetch_add(1, Ordering::Relaxed);
        self.record_bytes(up, down);
    }

    pub(crate) fn record_forward(&self, down: u64) {
        self.forwards.fetch_add(1, Ordering::Relaxed);
        self.record_bytes(0, down);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_empty(&self) {
        self.empty.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn record_bytes(&self, up: u64, down: u64) {
        self.bytes_up.fetch_add(up, Ordering::Relaxed);
        self.bytes_down.fetch_add(down, Ordering::Relaxed);
    }

    /// Currently active sessions
    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all statistics
    #[must_use]
    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active(),
            tunnels: self.tunnels.load(Ordering::Relaxed),
            forwards: self.forwards.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time proxy statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub tunnels: u64,
    pub forwards: u64,
    pub errors: u64,
    pub empty: u64,
    pub rejected: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}
