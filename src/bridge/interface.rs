//! Virtual network interface seam
//!
//! The host platform owns interface creation (consent prompts, routing
//! tables, per-app capture). The bridge only needs:
//!
//! - an [`InterfaceProvider`] that establishes the interface from an
//!   [`InterfaceConfig`], and
//! - a [`VirtualInterface`] that yields and accepts raw IP frames.
//!
//! [`FdInterface`] wraps a descriptor the host already configured (the
//! usual shape on Android). [`MemoryInterface`] is an in-process
//! implementation for embedding and tests.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::{parse_cidr, BridgeConfig};
use crate::error::BridgeError;

/// Settings handed to the platform when establishing the interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Session name shown by the platform
    pub session_name: String,
    /// Local address
    pub address: Ipv4Addr,
    /// Prefix length of the local address
    pub prefix_len: u8,
    /// Captured routes
    pub routes: Vec<(Ipv4Addr, u8)>,
    /// DNS server override
    pub dns_servers: Vec<Ipv4Addr>,
    /// MTU
    pub mtu: u16,
    /// Applications whose traffic is captured; all others bypass
    pub allowed_applications: Vec<String>,
}

impl InterfaceConfig {
    /// Build from the bridge section of the configuration
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Interface` for an unparseable route.
    pub fn from_bridge_config(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let routes = config
            .routes
            .iter()
            .map(|r| parse_cidr(r).map_err(|e| BridgeError::Interface(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            session_name: config.session_name.clone(),
            address: config.address,
            prefix_len: config.prefix_len,
            routes,
            dns_servers: config.dns_servers.clone(),
            mtu: config.mtu,
            allowed_applications: config.captured_applications(),
        })
    }

    /// Check the settings before asking the platform
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Interface` describing the first problem.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.prefix_len > 32 {
            return Err(BridgeError::Interface(format!(
                "prefix length {} exceeds 32",
                self.prefix_len
            )));
        }
        if self.routes.is_empty() {
            return Err(BridgeError::Interface("no routes to capture".into()));
        }
        if self.mtu < 576 {
            return Err(BridgeError::Interface(format!("MTU {} too small", self.mtu)));
        }
        if self.allowed_applications.is_empty() {
            return Err(BridgeError::Interface(
                "allowed application list is empty".into(),
            ));
        }
        Ok(())
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            session_name: "tun-proxy".into(),
            address: Ipv4Addr::new(10, 0, 0, 2),
            prefix_len: 24,
            routes: vec![(Ipv4Addr::UNSPECIFIED, 0)],
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8)],
            mtu: 1500,
            allowed_applications: vec!["tun-proxy".into(), "org.jellyfin.mobile".into()],
        }
    }
}

/// Frame-level access to an established interface
#[async_trait]
pub trait VirtualInterface: Send + Sync + fmt::Debug {
    /// Read one frame into `buf`, returning its length
    ///
    /// Fails once the interface is closed.
    async fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one frame
    async fn write_frame(&self, frame: &[u8]) -> io::Result<()>;

    /// Close the interface; later calls do nothing
    fn close(&self);
}

/// Platform capability that establishes the interface
pub trait InterfaceProvider: Send + Sync {
    /// Establish the interface
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Interface` if the platform refuses.
    fn establish(&self, config: &InterfaceConfig)
        -> Result<Arc<dyn VirtualInterface>, BridgeError>;
}

impl<F> InterfaceProvider for F
where
    F: Fn(&InterfaceConfig) -> Result<Arc<dyn VirtualInterface>, BridgeError> + Send + Sync,
{
    fn establish(
        &self,
        config: &InterfaceConfig,
    ) -> Result<Arc<dyn VirtualInterface>, BridgeError> {
        self(config)
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "interface closed")
}

/// Resolves once the close flag is set
async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed {
            return;
        }
        if closed.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// Descriptor-backed interface
// ============================================================================

/// Interface over a TUN descriptor
///
/// The descriptor is duplicated, so the host keeps ownership of its own
/// copy. `close` drops the duplicate and wakes any pending read.
pub struct FdInterface {
    fd: Mutex<Option<Arc<AsyncFd<File>>>>,
    raw: RawFd,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for FdInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdInterface")
            .field("fd", &self.raw)
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}

impl FdInterface {
    /// Wrap a duplicate of `fd`, switched to non-blocking mode
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the descriptor cannot be duplicated or
    /// registered with the reactor.
    pub fn from_fd(fd: BorrowedFd<'_>) -> io::Result<Self> {
        let owned = fd.try_clone_to_owned()?;
        let raw = owned.as_raw_fd();
        set_nonblocking(raw)?;

        let async_fd = AsyncFd::new(File::from(owned))?;
        debug!(fd = fd.as_raw_fd(), dup = raw, "Interface descriptor wrapped");

        let (closed, _) = watch::channel(false);
        Ok(Self {
            fd: Mutex::new(Some(Arc::new(async_fd))),
            raw,
            closed,
        })
    }

    fn current(&self) -> io::Result<Arc<AsyncFd<File>>> {
        self.fd.lock().as_ref().map(Arc::clone).ok_or_else(closed_error)
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; no memory is passed
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[async_trait]
impl VirtualInterface for FdInterface {
    async fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.current()?;
        let closed = self.closed.subscribe();

        let read = async {
            loop {
                let mut guard = fd.readable().await?;
                match guard.try_io(|inner| inner.get_ref().read(buf)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        };

        tokio::select! {
            result = read => result,
            () = wait_closed(closed) => Err(closed_error()),
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let fd = self.current()?;
        loop {
            let mut guard = fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(frame)) {
                Ok(Ok(n)) if n == frame.len() => return Ok(()),
                Ok(Ok(n)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short frame write: {n} of {} bytes", frame.len()),
                    ))
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    fn close(&self) {
        if self.fd.lock().take().is_some() {
            info!(fd = self.raw, "Interface closed");
            self.closed.send_replace(true);
        }
    }
}

/// Provider for a descriptor the host has already established
///
/// The host applies the [`InterfaceConfig`] itself; this provider checks it
/// and wraps the descriptor.
#[derive(Debug, Clone, Copy)]
pub struct FdInterfaceProvider {
    fd: RawFd,
}

impl FdInterfaceProvider {
    /// Provider for `fd`
    ///
    /// # Safety
    ///
    /// `fd` must stay open for as long as `establish` may be called.
    #[must_use]
    pub const unsafe fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl InterfaceProvider for FdInterfaceProvider {
    fn establish(
        &self,
        config: &InterfaceConfig,
    ) -> Result<Arc<dyn VirtualInterface>, BridgeError> {
        // SAFETY: the caller of `new` guarantees the descriptor is open
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let interface = FdInterface::from_fd(fd)
            .map_err(|e| BridgeError::Interface(format!("fd {}: {e}", self.fd)))?;
        info!(
            fd = self.fd,
            address = %config.address,
            prefix = config.prefix_len,
            mtu = config.mtu,
            "Using host-established interface"
        );
        Ok(Arc::new(interface))
    }
}

// ============================================================================
// In-memory interface
// ============================================================================

/// Interface backed by channels
///
/// Frames sent through the paired [`MemoryPeer`] are read by the bridge;
/// frames the bridge writes come out of the peer.
#[derive(Debug)]
pub struct MemoryInterface {
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: watch::Sender<bool>,
}

/// Far side of a [`MemoryInterface`]
#[derive(Debug)]
pub struct MemoryPeer {
    /// Frames to deliver to the interface reader
    pub inject: mpsc::Sender<Vec<u8>>,
    /// Frames written to the interface
    pub written: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryInterface {
    /// Create an interface and its peer; `capacity` bounds queued frames
    #[must_use]
    pub fn pair(capacity: usize) -> (Arc<Self>, MemoryPeer) {
        let (inject, inbound) = mpsc::channel(capacity.max(1));
        let (outbound, written) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        (
            Arc::new(Self {
                inbound: tokio::sync::Mutex::new(inbound),
                outbound,
                closed,
            }),
            MemoryPeer { inject, written },
        )
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl VirtualInterface for MemoryInterface {
    async fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let closed = self.closed.subscribe();

        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            frame = inbound.recv() => {
                let frame = frame.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::UnexpectedEof, "interface peer gone")
                })?;
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            () = wait_closed(closed) => Err(closed_error()),
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.outbound
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "interface peer gone"))
    }

    fn close(&self) {
        self.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
    }
}
