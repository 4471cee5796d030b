//! tun-proxy: forwarding HTTP/HTTPS proxy with a TUN packet bridge
//!
//! Two cooperating services:
//!
//! - a **forwarding proxy** that accepts one request per connection,
//!   tunnels `CONNECT host:port` opaquely and fetches `GET <url>` on the
//!   client's behalf, and
//! - a **tunnel bridge** that reads raw IPv4 frames from a virtual
//!   interface, recognizes TCP segments starting an HTTP request and hands
//!   each of them to the proxy.
//!
//! # Architecture
//!
//! ```text
//! virtual interface ──► TunnelBridge ──► packet::parse_frame
//!        ▲                   │             + ConnectionTracker
//!        │                   ▼
//!        │           protected socket ──► ProxyServer ──► origin server
//!        │                   │                 │
//!        └──── one read ◄────┴─────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use tun_proxy::config::load_config;
//! use tun_proxy::proxy::build_proxy;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/tun-proxy/config.json")?;
//! let (handle, task) = build_proxy(&config)?.spawn();
//!
//! // ... later
//! handle.stop();
//! task.await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`bridge`]: Virtual interface seam, socket protection, frame loop
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`io`]: Bidirectional relay
//! - [`packet`]: IPv4/TCP header parsing and handshake tracking
//! - [`proxy`]: Forwarding proxy
//! - [`remap`]: URL prefix remapping
//! - [`sniff`]: HTTP request detection and request-line parsing

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod io;
pub mod packet;
pub mod proxy;
pub mod remap;
pub mod sniff;

// Re-export commonly used types at the crate root
pub use bridge::{BridgeHandle, InterfaceProvider, SocketProtector, TunnelBridge, VirtualInterface};
pub use config::{BridgeConfig, Config, ProxyConfig};
pub use error::{BridgeError, ConfigError, PacketError, ProxyError, TunProxyError};
pub use packet::{parse_frame, ConnectionTracker, RawFrame, TcpFlowKey};
pub use proxy::{build_proxy, ProxyHandle, ProxyServer};
pub use remap::RemapTable;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
