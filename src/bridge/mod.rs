//! Packet bridge from a virtual interface to the forwarding proxy
//!
//! The host platform establishes the interface ([`InterfaceProvider`]) and
//! keeps the bridge's own proxy sockets out of capture
//! ([`SocketProtector`]). [`TunnelBridge`] reads raw frames, picks out TCP
//! segments that start an HTTP request and hands each one to the proxy.

pub mod interface;
pub mod protect;
pub mod stats;
pub mod tunnel;

pub use interface::{
    FdInterface, FdInterfaceProvider, InterfaceConfig, InterfaceProvider, MemoryInterface,
    MemoryPeer, VirtualInterface,
};
pub use protect::{connect_protected, MarkProtector, NoopProtector, SocketProtector};
pub use stats::{BridgeStats, BridgeStatsSnapshot};
pub use tunnel::{BridgeHandle, DropReason, FrameOutcome, TunnelBridge};
