//! Proxy TCP listener
//!
//! Binds the listening socket through `socket2` so that bind failures are
//! reported as [`ProxyError::Bind`] with the address attached.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::ProxyError;

/// Bound and listening proxy socket
#[derive(Debug)]
pub struct ProxyListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ProxyListener {
    /// Bind and listen on `addr`
    ///
    /// Port 0 picks an ephemeral port; see [`ProxyListener::local_addr`].
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Bind` if the port is in use or needs privileges
    /// the process lacks.
    pub fn bind(addr: SocketAddr, backlog: u32) -> Result<Self, ProxyError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ProxyError::bind(addr, format!("socket: {e}")))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| ProxyError::bind(addr, format!("SO_REUSEADDR: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ProxyError::bind(addr, format!("O_NONBLOCK: {e}")))?;

        socket
            .bind(&addr.into())
            .map_err(|e| ProxyError::bind(addr, e.to_string()))?;

        let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
        socket
            .listen(backlog)
            .map_err(|e| ProxyError::bind(addr, format!("listen: {e}")))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener =
            TcpListener::from_std(std_listener).map_err(|e| ProxyError::bind(addr, e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::bind(addr, e.to_string()))?;

        info!(addr = %local_addr, backlog, "Proxy listener ready");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept the next client session
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Accept` if the accept call fails.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ProxyError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| ProxyError::Accept(e.to_string()))?;
        debug!(peer = %peer, "Accepted connection");
        Ok((stream, peer))
    }

    /// Address actually bound
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
