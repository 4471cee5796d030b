//! Frame loop between the virtual interface and the forwarding proxy
//!
//! Each frame read from the interface goes through:
//!
//! ```text
//! parse ─► track handshake ─► payload? ─► HTTP method? ─► protected dial
//!   │            │                │             │              │
//!   ▼            ▼                ▼             ▼              ▼
//! drop      Handshake           drop          drop     write payload,
//!                                                      one read, reply
//!                                                      onto interface
//! ```
//!
//! There is no stream reassembly: every payload-bearing frame gets its own
//! proxy connection and exactly one read of the answer. A frame that fails
//! is logged, counted and skipped; only interface read errors end the loop.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::interface::{InterfaceConfig, InterfaceProvider, VirtualInterface};
use super::protect::{connect_protected, SocketProtector};
use super::stats::BridgeStats;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, PacketError};
use crate::packet::{parse_frame, ConnectionTracker};
use crate::sniff::http::{looks_like_http_request, sniff_http_host};

/// Why a frame was not forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Not an IPv4/TCP frame
    Unparseable(PacketError),
    /// TCP segment without payload
    NoPayload,
    /// Payload does not start with an HTTP method
    NotHttp,
}

/// Result of processing one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Bare SYN recorded by the tracker
    Handshake,
    /// Frame ignored
    Dropped(DropReason),
    /// Payload sent to the proxy; the response (if any) was written back
    Forwarded {
        request_bytes: usize,
        response_bytes: usize,
    },
}

/// Bridge between an established interface and the forwarding proxy
#[derive(Debug)]
pub struct TunnelBridge {
    interface: Arc<dyn VirtualInterface>,
    tracker: ConnectionTracker,
    protector: Arc<dyn SocketProtector>,
    proxy_addr: SocketAddr,
    read_buffer_size: usize,
    exchange_timeout: Option<Duration>,
    running: AtomicBool,
    handle: BridgeHandle,
}

/// Caller-owned lifecycle handle for a [`TunnelBridge`]
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
    stopped: Arc<AtomicBool>,
    interface: Arc<dyn VirtualInterface>,
    stats: Arc<BridgeStats>,
}

impl BridgeHandle {
    /// Stop the bridge and close the interface
    ///
    /// Returns `true` on the first call and `false` (doing nothing) after.
    pub fn stop(&self) -> bool {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        info!("Stopping tunnel bridge");
        let _ = self.shutdown_tx.send(true);
        self.interface.close();
        true
    }

    /// Whether `stop` has been called
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Shared statistics
    #[must_use]
    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }
}

impl TunnelBridge {
    /// Establish the interface through `provider` and set up the bridge
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Interface` if the settings are invalid or the
    /// platform refuses the interface.
    pub fn establish(
        provider: &dyn InterfaceProvider,
        config: &BridgeConfig,
        protector: Arc<dyn SocketProtector>,
    ) -> Result<Self, BridgeError> {
        let interface_config = InterfaceConfig::from_bridge_config(config)?;
        interface_config.validate()?;

        let interface = provider.establish(&interface_config)?;
        info!(
            session = %interface_config.session_name,
            address = %interface_config.address,
            prefix = interface_config.prefix_len,
            mtu = interface_config.mtu,
            apps = ?interface_config.allowed_applications,
            proxy = %config.dial_addr(),
            "Interface established"
        );

        Ok(Self::new(
            interface,
            ConnectionTracker::new(config.max_tracked_flows, config.evict_on_close),
            protector,
            config,
        ))
    }

    /// Bridge over an interface that is already established
    #[must_use]
    pub fn new(
        interface: Arc<dyn VirtualInterface>,
        tracker: ConnectionTracker,
        protector: Arc<dyn SocketProtector>,
        config: &BridgeConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let handle = BridgeHandle {
            shutdown_tx: Arc::new(shutdown_tx),
            stopped: Arc::new(AtomicBool::new(false)),
            interface: Arc::clone(&interface),
            stats: Arc::new(BridgeStats::new()),
        };

        Self {
            interface,
            tracker,
            protector,
            proxy_addr: config.dial_addr(),
            read_buffer_size: config.read_buffer_size,
            exchange_timeout: config.exchange_timeout(),
            running: AtomicBool::new(false),
            handle,
        }
    }

    /// Lifecycle handle; clone freely
    #[must_use]
    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    /// Handshake tracker
    #[must_use]
    pub const fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Stop the bridge; see [`BridgeHandle::stop`]
    pub fn stop(&self) -> bool {
        self.handle.stop()
    }

    /// Read and process frames until stopped
    ///
    /// The interface is closed when this returns.
    ///
    /// # Errors
    ///
    /// - `State` if the bridge is already running or was stopped
    /// - `InterfaceIo` if reading the interface fails while running
    pub async fn run(&self) -> Result<(), BridgeError> {
        if self.handle.is_stopped() {
            return Err(BridgeError::State("bridge was stopped".into()));
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Err(BridgeError::State("bridge is already running".into()));
        }

        let result = self.frame_loop().await;

        self.interface.close();
        self.running.store(false, Ordering::SeqCst);

        let snapshot = self.handle.stats.snapshot();
        let tracker = self.tracker.snapshot();
        info!(
            frames = snapshot.frames_read,
            handshakes = snapshot.handshakes,
            forwarded = snapshot.forwarded,
            dropped = snapshot.dropped,
            failed = snapshot.failed,
            tracked_flows = tracker.tracked,
            "Tunnel bridge stopped"
        );
        result
    }

    async fn frame_loop(&self) -> Result<(), BridgeError> {
        let mut shutdown_rx = self.handle.shutdown_tx.subscribe();
        let mut buf = vec![0u8; self.read_buffer_size];
        let stats = &self.handle.stats;

        info!(proxy = %self.proxy_addr, "Tunnel bridge running");

        loop {
            if *shutdown_rx.borrow_and_update() {
                return Ok(());
            }

            let read = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => continue,
                read = self.interface.read_frame(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => continue,
                Ok(n) => n,
                Err(_) if self.handle.is_stopped() => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "Interface read failed");
                    return Err(BridgeError::InterfaceIo(e));
                }
            };

            stats.record_frame();
            match self.process_frame(&buf[..n]).await {
                Ok(FrameOutcome::Handshake) => stats.record_handshake(),
                Ok(FrameOutcome::Dropped(reason)) => {
                    trace!(len = n, reason = ?reason, "Frame dropped");
                    stats.record_dropped();
                }
                Ok(FrameOutcome::Forwarded {
                    request_bytes,
                    response_bytes,
                }) => stats.record_forwarded(request_bytes, response_bytes),
                Err(e) => {
                    warn!(len = n, error = %e, "Frame processing failed");
                    stats.record_failed();
                }
            }
        }
    }

    /// Process a single frame
    ///
    /// Frames that are not forwardable come back as `Ok(Dropped(_))`.
    ///
    /// # Errors
    ///
    /// Returns an error when the proxy exchange or the write back onto the
    /// interface fails. The error concerns this frame only.
    pub async fn process_frame(&self, data: &[u8]) -> Result<FrameOutcome, BridgeError> {
        let frame = match parse_frame(data) {
            Ok(frame) => frame,
            Err(e) => return Ok(FrameOutcome::Dropped(DropReason::Unparseable(e))),
        };

        let key = frame.flow_key();
        if self.tracker.observe(key, frame.syn(), frame.ack()) {
            trace!(flow = %key, "Handshake");
            return Ok(FrameOutcome::Handshake);
        }
        if frame.is_closing() {
            self.tracker.observe_close(key);
        }

        let Some(payload) = frame.payload() else {
            return Ok(FrameOutcome::Dropped(DropReason::NoPayload));
        };
        if !looks_like_http_request(payload) {
            return Ok(FrameOutcome::Dropped(DropReason::NotHttp));
        }

        debug!(
            frame = %frame,
            host = sniff_http_host(payload).as_deref().unwrap_or("-"),
            "Forwarding HTTP payload"
        );

        let response = self.exchange(payload).await?;
        if !response.is_empty() {
            self.interface
                .write_frame(&response)
                .await
                .map_err(BridgeError::InterfaceIo)?;
        }

        Ok(FrameOutcome::Forwarded {
            request_bytes: payload.len(),
            response_bytes: response.len(),
        })
    }

    /// One request/response round on a fresh protected connection
    async fn exchange(&self, payload: &[u8]) -> Result<Vec<u8>, BridgeError> {
        let round = async {
            let mut stream =
                connect_protected(self.proxy_addr, self.protector.as_ref(), None).await?;

            stream
                .write_all(payload)
                .await
                .map_err(BridgeError::ProxyExchange)?;
            stream.flush().await.map_err(BridgeError::ProxyExchange)?;

            let mut response = vec![0u8; self.read_buffer_size];
            let n = stream
                .read(&mut response)
                .await
                .map_err(BridgeError::ProxyExchange)?;
            response.truncate(n);
            Ok(response)
        };

        match self.exchange_timeout {
            Some(limit) => tokio::time::timeout(limit, round).await.map_err(|_| {
                BridgeError::ProxyExchange(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "proxy exchange timed out",
                ))
            })?,
            None => round.await,
        }
    }
}
