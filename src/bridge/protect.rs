//! Socket protection
//!
//! Sockets the bridge opens toward the proxy must be excluded from capture
//! by the virtual interface, or every forwarded request would be captured
//! again. The host provides a [`SocketProtector`]; the socket is protected
//! before it connects, and a refusal fails the connection.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::BridgeError;

/// Host capability excluding a socket from interface capture
pub trait SocketProtector: Send + Sync {
    /// Protect `fd`; `false` means the host refused
    fn protect(&self, fd: RawFd) -> bool;
}

impl<F> SocketProtector for F
where
    F: Fn(RawFd) -> bool + Send + Sync,
{
    fn protect(&self, fd: RawFd) -> bool {
        self(fd)
    }
}

/// Protector for hosts where the proxy socket is never captured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _fd: RawFd) -> bool {
        true
    }
}

/// Protector tagging sockets with a firewall mark (`SO_MARK`)
///
/// Policy routing on the host sends marked traffic around the interface.
/// Setting the mark needs `CAP_NET_ADMIN`; without it every socket is
/// refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkProtector {
    mark: u32,
}

impl MarkProtector {
    /// Protector applying `mark`
    #[must_use]
    pub const fn new(mark: u32) -> Self {
        Self { mark }
    }

    /// The mark applied to each socket
    #[must_use]
    pub const fn mark(&self) -> u32 {
        self.mark
    }
}

impl SocketProtector for MarkProtector {
    fn protect(&self, fd: RawFd) -> bool {
        // SAFETY: `connect_protected` passes a socket it owns for the whole call
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        match set_mark(SockRef::from(&fd), self.mark) {
            Ok(()) => true,
            Err(e) => {
                warn!(mark = self.mark, error = %e, "Failed to set socket mark");
                false
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_mark(socket: SockRef<'_>, mark: u32) -> io::Result<()> {
    socket.set_mark(mark)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_mark(_socket: SockRef<'_>, _mark: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_MARK is not available on this platform",
    ))
}

impl fmt::Debug for dyn SocketProtector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SocketProtector")
    }
}

/// Connect to `addr` on a protected socket
///
/// # Errors
///
/// - `ProtectRefused` if the protector declines the socket
/// - `ProxyConnect` if the socket cannot be created, the connect fails or
///   `timeout` elapses
pub async fn connect_protected(
    addr: SocketAddr,
    protector: &dyn SocketProtector,
    timeout: Option<Duration>,
) -> Result<TcpStream, BridgeError> {
    let connect = async {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| BridgeError::proxy_connect(addr, format!("socket: {e}")))?;

        let fd = socket.as_raw_fd();
        if !protector.protect(fd) {
            warn!(fd, "Socket protection refused");
            return Err(BridgeError::ProtectRefused { fd });
        }
        debug!(fd, "Socket protected");

        start_connect(&socket, addr).map_err(|e| BridgeError::proxy_connect(addr, e.to_string()))?;

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)
            .map_err(|e| BridgeError::proxy_connect(addr, e.to_string()))?;

        stream
            .writable()
            .await
            .map_err(|e| BridgeError::proxy_connect(addr, e.to_string()))?;
        match stream.take_error() {
            Ok(None) => Ok(stream),
            Ok(Some(e)) | Err(e) => Err(BridgeError::proxy_connect(addr, e.to_string())),
        }
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| BridgeError::proxy_connect(addr, "connect timed out"))?,
        None => connect.await,
    }
}

fn start_connect(socket: &Socket, addr: SocketAddr) -> io::Result<()> {
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(e),
    }
}
