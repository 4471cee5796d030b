//! CONNECT tunneling
//!
//! Opens a TCP connection to the requested `host:port`, answers the client
//! with `200 Connection Established` and relays bytes both ways. When
//! either side finishes, the other is given a short linger and then both
//! are dropped. The target socket is owned by the relay and closed exactly
//! once when it returns.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info};

use super::response::CONNECT_ESTABLISHED;
use crate::error::ProxyError;
use crate::io::{relay_bidirectional, CopyResult, HALF_CLOSE_LINGER};

/// Port used when a CONNECT target names no port
pub const DEFAULT_CONNECT_PORT: u16 = 443;

/// Split a CONNECT target into host and port
///
/// Accepts `host:port`, a bare `host` (port 443) and `[v6]:port`.
///
/// # Errors
///
/// Returns `ProxyError::MalformedTarget` for an empty host, an empty or
/// non-numeric port, or extra colons.
pub fn parse_connect_target(target: &str) -> Result<(String, u16), ProxyError> {
    let malformed = || ProxyError::MalformedTarget {
        target: target.to_string(),
    };

    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(malformed)?;
        match after {
            "" => (host, None),
            _ => (host, Some(after.strip_prefix(':').ok_or_else(malformed)?)),
        }
    } else {
        let mut parts = target.split(':');
        let host = parts.next().unwrap_or_default();
        let port = parts.next();
        if parts.next().is_some() {
            return Err(malformed());
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(malformed());
    }
    let port = match port {
        None => DEFAULT_CONNECT_PORT,
        Some(p) => p.parse::<u16>().map_err(|_| malformed())?,
    };
    Ok((host.to_string(), port))
}

/// Handle `CONNECT target`
///
/// Errors before the `200` reply are returned so the caller can send a
/// structured error. Once the relay has started, its end is a normal close
/// and the byte counts are returned.
///
/// # Errors
///
/// - `MalformedTarget` if `target` does not parse
/// - `UpstreamConnect` if the target is unreachable or the connect times out
/// - `Io` if the `200` reply cannot be written
pub async fn handle_https_connect<S>(
    client: &mut S,
    target: &str,
    buf_size: usize,
    connect_timeout: Option<Duration>,
    shutdown: watch::Receiver<bool>,
) -> Result<CopyResult, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port) = parse_connect_target(target)?;

    let connect = TcpStream::connect((host.as_str(), port));
    let upstream = match connect_timeout {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| ProxyError::upstream_connect(target, "connection timed out"))?,
        None => connect.await,
    }
    .map_err(|e| ProxyError::upstream_connect(target, e.to_string()))?;

    let _ = upstream.set_nodelay(true);
    debug!(target = %target, "Upstream connected");

    client.write_all(CONNECT_ESTABLISHED).await?;
    client.flush().await?;

    let (result, outcome) =
        relay_bidirectional(client, upstream, buf_size, HALF_CLOSE_LINGER, shutdown).await;
    if let Err(e) = outcome {
        debug!(target = %target, error = %e, "Tunnel closed by I/O error");
    }

    info!(
        target = %target,
        up = result.client_to_upstream,
        down = result.upstream_to_client,
        "Tunnel closed"
    );
    Ok(result)
}
