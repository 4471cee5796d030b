//! Forwarding HTTP/HTTPS proxy
//!
//! Accepts one request per connection. `CONNECT host:port` opens an opaque
//! tunnel, `GET <absolute-url>` is fetched and relayed, anything else gets
//! a structured `500` response.

pub mod forward;
pub mod handler;
pub mod listener;
pub mod response;
pub mod server;
pub mod stats;
pub mod tunnel;

pub use forward::{ForwardOutcome, Forwarder};
pub use handler::{handle_connection, HandlerContext, SessionOutcome};
pub use listener::ProxyListener;
pub use response::{error_response, CONNECT_ESTABLISHED};
pub use server::{ProxyHandle, ProxyServer};
pub use stats::{ProxyStats, ProxyStatsSnapshot};
pub use tunnel::parse_connect_target;

use crate::config::Config;
use crate::error::TunProxyError;
use crate::remap::RemapTable;

/// Build and bind a proxy from the full configuration
///
/// Loads the remap table (inline rules and rules file) and sets up the
/// GET forwarder with the configured cache.
///
/// # Errors
///
/// Returns a config error for a bad remap file, or a bind error.
pub fn build_proxy(config: &Config) -> Result<ProxyServer, TunProxyError> {
    let remap = RemapTable::from_config(&config.remap)?;
    let forwarder = Forwarder::new(remap, &config.cache, config.proxy.connect_timeout());
    Ok(ProxyServer::listen(&config.proxy, forwarder)?)
}
