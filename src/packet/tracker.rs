//! TCP handshake tracking
//!
//! The tracker remembers which (source port, destination port) pairs have
//! sent a bare SYN. Membership is informational: a payload-bearing segment
//! is inspected whether or not its flow was seen opening.
//!
//! The set is a `DashSet`, so several frame loops may share one tracker.
//! Flows are forgotten on FIN/RST when eviction is enabled, and the set can
//! be capped; both are off in [`ConnectionTracker::unbounded`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashSet;
use tracing::trace;

/// Flow identity: (source port, destination port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TcpFlowKey {
    pub src_port: u16,
    pub dst_port: u16,
}

impl TcpFlowKey {
    /// Create a flow key
    #[must_use]
    pub const fn new(src_port: u16, dst_port: u16) -> Self {
        Self { src_port, dst_port }
    }
}

impl fmt::Display for TcpFlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src_port, self.dst_port)
    }
}

/// Set of flows with an observed handshake
#[derive(Debug)]
pub struct ConnectionTracker {
    flows: DashSet<TcpFlowKey>,
    /// 0 means unbounded
    max_flows: usize,
    evict_on_close: bool,
    handshakes: AtomicU64,
    evicted: AtomicU64,
    overflowed: AtomicU64,
}

impl ConnectionTracker {
    /// Create a tracker with a capacity bound and FIN/RST eviction toggle
    #[must_use]
    pub fn new(max_flows: usize, evict_on_close: bool) -> Self {
        Self {
            flows: DashSet::new(),
            max_flows,
            evict_on_close,
            handshakes: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            overflowed: AtomicU64::new(0),
        }
    }

    /// Eviction-free tracker that grows for its whole lifetime
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(0, false)
    }

    /// Record a segment's SYN/ACK flags
    ///
    /// Returns `true` for a bare SYN (SYN set, ACK clear); the caller must
    /// then treat the segment as handshake-only. Inserting a known key is a
    /// no-op.
    pub fn observe(&self, key: TcpFlowKey, syn: bool, ack: bool) -> bool {
        if !syn || ack {
            return false;
        }

        self.handshakes.fetch_add(1, Ordering::Relaxed);
        if self.flows.contains(&key) {
            return true;
        }
        if self.max_flows > 0 && self.flows.len() >= self.max_flows {
            self.overflowed.fetch_add(1, Ordering::Relaxed);
            trace!(flow = %key, "Tracker full, handshake not recorded");
            return true;
        }
        self.flows.insert(key);
        trace!(flow = %key, "Handshake recorded");
        true
    }

    /// Forget a flow after FIN or RST, if eviction is enabled
    ///
    /// Returns `true` when an entry was removed.
    pub fn observe_close(&self, key: TcpFlowKey) -> bool {
        if !self.evict_on_close {
            return false;
        }
        let removed = self.flows.remove(&key).is_some();
        if removed {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            trace!(flow = %key, "Flow evicted");
        }
        removed
    }

    /// Whether a handshake was seen for this flow
    #[must_use]
    pub fn contains(&self, key: &TcpFlowKey) -> bool {
        self.flows.contains(key)
    }

    /// Number of tracked flows
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// No flows tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Counter snapshot
    #[must_use]
    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            tracked: self.flows.len(),
            handshakes: self.handshakes.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Point-in-time tracker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerSnapshot {
    pub tracked: usize,
    pub handshakes: u64,
    pub evicted: u64,
    pub overflowed: u64,
}
