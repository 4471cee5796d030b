//! HTTP request detection and request-line parsing
//!
//! Two consumers use this module:
//!
//! - the tunnel bridge, which only needs to know whether a TCP payload
//!   starts an HTTP request ([`looks_like_http_request`]) and, for logging,
//!   which host it targets ([`sniff_http_host`]);
//! - the forwarding proxy, which splits the first line of a client session
//!   into a [`ParsedRequestLine`].
//!
//! ## Example
//!
//! ```
//! use tun_proxy::sniff::http::{looks_like_http_request, parse_request_line, Method};
//!
//! let data = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
//! assert!(looks_like_http_request(data));
//!
//! let line = parse_request_line("CONNECT example.com:443 HTTP/1.1\r\n").unwrap();
//! assert_eq!(line.method, Method::Connect);
//! assert_eq!(line.target, "example.com:443");
//! ```

use tracing::trace;

use crate::error::ProxyError;

/// Method tokens that start an HTTP request, each with its trailing space
pub const HTTP_METHOD_TOKENS: [&[u8]; 8] = [
    b"GET ",
    b"POST ",
    b"HEAD ",
    b"PUT ",
    b"DELETE ",
    b"CONNECT ",
    b"OPTIONS ",
    b"TRACE ",
];

/// Longest method token, the number of payload bytes inspected
pub const SNIFF_PREFIX_LEN: usize = 8;

/// Maximum number of headers parsed when extracting the Host header
const MAX_HEADERS: usize = 64;

/// Check whether a payload begins with a known HTTP method token
///
/// Only the first [`SNIFF_PREFIX_LEN`] bytes are inspected. Matching is
/// case-sensitive, as request methods on the wire are.
#[must_use]
pub fn looks_like_http_request(payload: &[u8]) -> bool {
    let prefix = &payload[..payload.len().min(SNIFF_PREFIX_LEN)];
    HTTP_METHOD_TOKENS
        .iter()
        .any(|token| prefix.starts_with(token))
}

/// Extract the Host header (without port) from a request payload
///
/// Returns `None` when the payload is not a parseable request or carries
/// no Host header.
#[must_use]
pub fn sniff_http_host(payload: &[u8]) -> Option<String> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    if let Err(e) = req.parse(payload) {
        trace!("HTTP parse error: {:?}", e);
        return None;
    }

    req.headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(|v| strip_port(v.trim()).to_ascii_lowercase())
        .filter(|h| !h.is_empty())
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((h, port)) if port.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    }
}

/// Request method, as far as the proxy cares
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Connect,
    Other(String),
}

impl Method {
    /// Classify a method token, ignoring ASCII case
    #[must_use]
    pub fn from_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("GET") {
            Self::Get
        } else if token.eq_ignore_ascii_case("CONNECT") {
            Self::Connect
        } else {
            Self::Other(token.to_string())
        }
    }
}

/// First line of a client session, split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequestLine {
    /// Dispatch method
    pub method: Method,
    /// Request target: an absolute URL for GET, `host:port` for CONNECT
    pub target: String,
    /// Protocol version token, e.g. `HTTP/1.1`
    pub version: String,
}

/// Split a request line into method, target and version
///
/// The trailing line terminator is ignored.
///
/// # Errors
///
/// Returns `ProxyError::InvalidRequestLine` when the line has fewer than
/// three whitespace-separated fields.
pub fn parse_request_line(line: &str) -> Result<ParsedRequestLine, ProxyError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version)) => Ok(ParsedRequestLine {
            method: Method::from_token(method),
            target: target.to_string(),
            version: version.to_string(),
        }),
        _ => Err(ProxyError::InvalidRequestLine {
            line: line.trim_end().to_string(),
        }),
    }
}
