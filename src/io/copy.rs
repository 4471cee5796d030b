//! Bidirectional relay between two async streams
//!
//! Each direction copies through its own fixed-size buffer until the source
//! reaches end-of-stream, then half-closes the destination. Once one
//! direction is done the other gets [`HALF_CLOSE_LINGER`] to drain, after
//! which both streams are dropped. An I/O error in either direction ends
//! the relay at once, so a dead peer never leaves the other side open.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::trace;

/// Default per-direction relay buffer
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// Time the remaining direction may drain after the first one ends
pub const HALF_CLOSE_LINGER: Duration = Duration::from_secs(2);

/// Result of a bidirectional relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyResult {
    /// Bytes transferred from client to upstream
    pub client_to_upstream: u64,
    /// Bytes transferred from upstream to client
    pub upstream_to_client: u64,
}

impl CopyResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

/// Relay bytes between `client` and `upstream` until either side finishes
///
/// After the first direction reaches end-of-stream the other one keeps
/// running for at most `linger`, so a peer that ignores the half-close
/// cannot hold the relay open. Setting `shutdown` to `true` interrupts both
/// directions, including reads that are waiting for data. A reset or broken
/// pipe is an ordinary way for a tunnel to end, so the returned error is
/// informational.
///
/// # Errors
///
/// Returns the first I/O error from either direction, together with the
/// byte counts reached before it.
pub async fn relay_bidirectional<A, B>(
    client: A,
    upstream: B,
    buf_size: usize,
    linger: Duration,
    shutdown: watch::Receiver<bool>,
) -> (CopyResult, io::Result<()>)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let mut result = CopyResult::default();

    let outcome = {
        let up = copy_half(
            &mut client_read,
            &mut upstream_write,
            buf_size,
            shutdown.clone(),
            &mut result.client_to_upstream,
        );
        let down = copy_half(
            &mut upstream_read,
            &mut client_write,
            buf_size,
            shutdown,
            &mut result.upstream_to_client,
        );
        tokio::pin!(up);
        tokio::pin!(down);

        tokio::select! {
            first = &mut up => finish_other(first, down, linger, "upstream").await,
            first = &mut down => finish_other(first, up, linger, "client").await,
        }
    };

    trace!(
        up = result.client_to_upstream,
        down = result.upstream_to_client,
        "Relay finished"
    );

    (result, outcome)
}

/// Give the remaining direction `linger` to finish once the first is done
async fn finish_other<F>(
    first: io::Result<()>,
    other: Pin<&mut F>,
    linger: Duration,
    remaining: &str,
) -> io::Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    first?;
    match tokio::time::timeout(linger, other).await {
        Ok(outcome) => outcome,
        Err(_) => {
            trace!(remaining, "Half-close not answered, dropping both sides");
            Ok(())
        }
    }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf_size: usize,
    mut shutdown: watch::Receiver<bool>,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buf_size.max(1)];
    loop {
        let n = tokio::select! {
            biased;
            () = stop_requested(&mut shutdown) => break,
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
    // Half-close; the peer may already be gone
    let _ = writer.shutdown().await;
    Ok(())
}

/// Resolves once `shutdown` reads `true`; never if the sender is gone
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
