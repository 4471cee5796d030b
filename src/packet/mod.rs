//! Raw frame decoding and flow tracking for the tunnel bridge

pub mod header;
pub mod tracker;

pub use header::{parse_frame, tcp_flags, RawFrame, IPPROTO_TCP};
pub use tracker::{ConnectionTracker, TcpFlowKey, TrackerSnapshot};
