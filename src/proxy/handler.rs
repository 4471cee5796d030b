//! Per-session request handling
//!
//! A session is read up to its first line, dispatched once on the method
//! and closed. The states are
//!
//! ```text
//! ACCEPTED -> REQUEST_PARSED -> { TUNNELING | FORWARDING | ERROR } -> CLOSED
//! ```
//!
//! and every path, including a client that disconnects without sending
//! anything, ends with the session dropped.

use std::io;
use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::watch;
use tracing::{debug, trace};

use super::forward::{ForwardOutcome, Forwarder};
use super::response::write_error_response;
use super::tunnel::handle_https_connect;
use crate::error::ProxyError;
use crate::io::CopyResult;
use crate::sniff::http::{parse_request_line, Method};

/// Longest request or header line read
const MAX_LINE_LEN: u64 = 8 * 1024;

/// Header lines skipped after the request line before giving up
const MAX_HEADER_LINES: usize = 128;

/// Shared, read-only state for session handlers
#[derive(Debug)]
pub struct HandlerContext {
    forwarder: Forwarder,
    relay_buffer_size: usize,
    connect_timeout: Option<Duration>,
    shutdown: watch::Receiver<bool>,
}

impl HandlerContext {
    /// Create a handler context
    ///
    /// `shutdown` flips to `true` when the proxy stops; CONNECT relays
    /// end as soon as it flips.
    #[must_use]
    pub fn new(
        forwarder: Forwarder,
        relay_buffer_size: usize,
        connect_timeout: Option<Duration>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            forwarder,
            relay_buffer_size,
            connect_timeout,
            shutdown,
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Client closed before sending a request line
    Closed,
    /// CONNECT tunnel ran and closed
    Tunneled(CopyResult),
    /// GET response written
    Forwarded(ForwardOutcome),
    /// Structured error written (or attempted) with this body
    Failed { message: String },
}

/// Handle one client session to completion
pub async fn handle_connection<S>(stream: S, ctx: &HandlerContext) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = BufReader::new(stream);

    let line = match read_line(&mut session).await {
        Ok(Some(line)) => line,
        Ok(None) => {
            trace!("Client closed before sending a request");
            return SessionOutcome::Closed;
        }
        Err(e) => {
            debug!(error = %e, "Failed to read request line");
            return SessionOutcome::Closed;
        }
    };

    let outcome = match dispatch(&mut session, &line, ctx).await {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!(error = %e, "Request failed");
            let message = e.client_message();
            if let Err(write_err) = write_error_response(&mut session, &message).await {
                trace!(error = %write_err, "Could not deliver error response");
            }
            SessionOutcome::Failed { message }
        }
    };

    // FIN after the response; the tunnel path has already half-closed
    let _ = session.shutdown().await;
    outcome
}

async fn dispatch<S>(
    session: &mut BufReader<S>,
    line: &str,
    ctx: &HandlerContext,
) -> Result<SessionOutcome, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = parse_request_line(line)?;
    debug!(method = ?request.method, target = %request.target, "Request parsed");

    match request.method {
        Method::Connect => {
            skip_headers(session).await?;
            let result = handle_https_connect(
                session,
                &request.target,
                ctx.relay_buffer_size,
                ctx.connect_timeout,
                ctx.shutdown.clone(),
            )
            .await?;
            Ok(SessionOutcome::Tunneled(result))
        }
        Method::Get => {
            skip_headers(session).await?;
            let outcome = ctx
                .forwarder
                .handle_http_get(session, &request.target)
                .await?;
            Ok(SessionOutcome::Forwarded(outcome))
        }
        Method::Other(method) => Err(ProxyError::UnsupportedMethod { method }),
    }
}

/// Read one line, `None` at end of stream
async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Consume request headers up to the blank line
///
/// Bytes after the blank line stay buffered and are relayed first.
async fn skip_headers<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    for _ in 0..MAX_HEADER_LINES {
        match read_line(reader).await? {
            None => return Ok(()),
            Some(line) if line.trim().is_empty() => return Ok(()),
            Some(line) => trace!(header = %line.trim_end(), "Skipping request header"),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "too many request header lines",
    ))
}
