//! Proxy accept loop and lifecycle
//!
//! [`ProxyServer::listen`] binds, [`ProxyServer::serve`] runs the accept
//! loop and [`ProxyHandle::stop`] ends it. Stopping closes the listener but
//! does not cancel sessions already being handled; CONNECT relays end as
//! soon as they see the stop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::forward::Forwarder;
use super::handler::{handle_connection, HandlerContext, SessionOutcome};
use super::listener::ProxyListener;
use super::response::write_error_response;
use super::stats::ProxyStats;
use crate::config::ProxyConfig;
use crate::error::ProxyError;

/// Pause after a failed accept, so a persistent error (EMFILE) does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// How long a rejected client's unread request is drained before closing
const REJECT_DRAIN: Duration = Duration::from_secs(1);

/// Forwarding proxy bound to its listening socket
#[derive(Debug)]
pub struct ProxyServer {
    listener: ProxyListener,
    ctx: Arc<HandlerContext>,
    stats: Arc<ProxyStats>,
    limit: Arc<Semaphore>,
    max_connections: usize,
    handle: ProxyHandle,
}

/// Caller-owned lifecycle handle for a [`ProxyServer`]
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
    stopped: Arc<AtomicBool>,
    local_addr: SocketAddr,
    stats: Arc<ProxyStats>,
}

impl ProxyHandle {
    /// Stop the proxy
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
        info!(addr = %self.local_addr, "Stopping proxy");
        let _ = self.shutdown_tx.send(true);
        true
    }

    /// Whether `stop` has been called
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Address the proxy listens on
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared statistics
    #[must_use]
    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }
}

impl ProxyServer {
    /// Bind the proxy listener
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Bind` if the listen address is unavailable.
    pub fn listen(config: &ProxyConfig, forwarder: Forwarder) -> Result<Self, ProxyError> {
        let listener = ProxyListener::bind(config.listen, config.backlog)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(ProxyStats::new());

        let ctx = HandlerContext::new(
            forwarder,
            config.relay_buffer_size,
            config.connect_timeout(),
            shutdown_rx,
        );

        let handle = ProxyHandle {
            shutdown_tx: Arc::new(shutdown_tx),
            stopped: Arc::new(AtomicBool::new(false)),
            local_addr: listener.local_addr(),
            stats: Arc::clone(&stats),
        };

        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
            stats,
            limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            handle,
        })
    }

    /// Address actually bound
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Lifecycle handle; clone freely
    #[must_use]
    pub fn handle(&self) -> ProxyHandle {
        self.handle.clone()
    }

    /// Run `serve` on a new task
    pub fn spawn(self) -> (ProxyHandle, JoinHandle<()>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.serve()))
    }

    /// Accept sessions until stopped
    ///
    /// Each session runs on its own task. Accept errors are logged and the
    /// loop continues. The listener is closed when this returns.
    pub async fn serve(self) {
        let mut shutdown_rx = self.handle.shutdown_tx.subscribe();
        info!(addr = %self.local_addr(), "Proxy serving");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            self.dispatch(stream, peer);
                        }
                        Err(e) => {
                            if self.handle.is_stopped() {
                                break;
                            }
                            warn!(error = %e, "Accept failed");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        let snapshot = self.stats.snapshot();
        info!(
            addr = %self.local_addr(),
            accepted = snapshot.accepted,
            active = snapshot.active,
            tunnels = snapshot.tunnels,
            forwards = snapshot.forwards,
            errors = snapshot.errors,
            "Proxy stopped"
        );
    }

    fn dispatch(&self, mut stream: tokio::net::TcpStream, peer: SocketAddr) {
        let stats = Arc::clone(&self.stats);

        let Ok(permit) = Arc::clone(&self.limit).try_acquire_owned() else {
            stats.record_rejected();
            let limit = self.max_connections;
            warn!(peer = %peer, limit, "Connection limit reached");
            tokio::spawn(async move {
                let message = ProxyError::ConnectionLimit { limit }.client_message();
                let _ = write_error_response(&mut stream, &message).await;
                let _ = stream.shutdown().await;

                // Unread request bytes at close would reset the response
                let mut sink = [0u8; 1024];
                let _ = tokio::time::timeout(REJECT_DRAIN, async {
                    while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                })
                .await;
            });
            return;
        };

        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(
            async move {
                let _permit = permit;
                stats.record_accepted();

                match handle_connection(stream, &ctx).await {
                    SessionOutcome::Closed => stats.record_empty(),
                    SessionOutcome::Tunneled(result) => {
                        stats.record_tunnel(result.client_to_upstream, result.upstream_to_client);
                    }
                    SessionOutcome::Forwarded(outcome) => stats.record_forward(outcome.body_bytes),
                    SessionOutcome::Failed { message } => {
                        debug!(message = %message, "Session answered with error");
                        stats.record_error();
                    }
                }

                stats.record_finished();
            }
            .instrument(info_span!("conn", peer = %peer)),
        );
    }
}
