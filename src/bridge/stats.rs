//! Bridge frame statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic bridge counters
#[derive(Debug, Default)]
pub struct BridgeStats {
    frames_read: AtomicU64,
    handshakes: AtomicU64,
    dropped: AtomicU64,
    forwarded: AtomicU64,
    failed: AtomicU64,
    bytes_to_proxy: AtomicU64,
    bytes_from_proxy: AtomicU64,
}

impl BridgeStats {
    /// Create zeroed statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_frame(&self) {
        self.frames_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handshake(&self) {
        self.handshakes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forwarded(&self, request_bytes: usize, response_bytes: usize) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_proxy
            .fetch_add(request_bytes as u64, Ordering::Relaxed);
        self.bytes_from_proxy
            .fetch_add(response_bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            handshakes: self.handshakes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_to_proxy: self.bytes_to_proxy.load(Ordering::Relaxed),
            bytes_from_proxy: self.bytes_from_proxy.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`BridgeStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatsSnapshot {
    pub frames_read: u64,
    pub handshakes: u64,
    pub dropped: u64,
    pub forwarded: u64,
    pub failed: u64,
    pub bytes_to_proxy: u64,
    pub bytes_from_proxy: u64,
}
