//! Error types for tun-proxy
//!
//! Errors are grouped by subsystem: configuration, the forwarding proxy,
//! frame decoding and the tunnel bridge. Each group carries a recovery hint
//! so callers can tell a per-connection or per-frame failure apart from a
//! startup failure that must be surfaced to the operator.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Body text for a request line with fewer than three fields
pub const MSG_INVALID_REQUEST: &str = "Invalid request format";

/// Body text for any method other than GET or CONNECT
pub const MSG_UNSUPPORTED_METHOD: &str = "Only GET and CONNECT methods are supported";

/// Top-level error type for tun-proxy
#[derive(Debug, Error)]
pub enum TunProxyError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Forwarding proxy errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Raw frame decoding errors
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Tunnel bridge errors
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunProxyError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Proxy(e) => e.is_recoverable(),
            Self::Packet(e) => e.is_recoverable(),
            Self::Bridge(e) => e.is_recoverable(),
            Self::Io(e) => is_transient_io(e),
        }
    }
}

fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
    )
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// Malformed line in a remap file
    #[error("Invalid remap rule at line {line}: {reason}")]
    RemapRule { line: usize, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Forwarding proxy errors
///
/// Everything except [`ProxyError::Bind`] happens inside a single client
/// session and is reported to that client as a structured error response.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind the listening socket
    #[error("Failed to bind to {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// Failed to accept a connection
    #[error("Accept error: {0}")]
    Accept(String),

    /// Request line had fewer than three fields
    #[error("Malformed request line: {line:?}")]
    InvalidRequestLine { line: String },

    /// Method other than GET or CONNECT
    #[error("Unsupported method: {method}")]
    UnsupportedMethod { method: String },

    /// CONNECT target that is not `host[:port]`
    #[error("Malformed CONNECT target: {target}")]
    MalformedTarget { target: String },

    /// CONNECT target unreachable
    #[error("Failed to connect to {target}: {reason}")]
    UpstreamConnect { target: String, reason: String },

    /// GET fetch or body copy failed
    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// Too many concurrent client sessions
    #[error("Connection limit reached ({limit})")]
    ConnectionLimit { limit: usize },

    /// I/O error on the client connection
    #[error("Proxy I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Bind { .. } => false,
            Self::Io(e) => is_transient_io(e),
            _ => true,
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Bind {
            addr,
            reason: reason.into(),
        }
    }

    /// Create an upstream connect error
    pub fn upstream_connect(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamConnect {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a fetch error
    pub fn fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Text placed in the body of the structured error response
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::InvalidRequestLine { .. } => MSG_INVALID_REQUEST.to_string(),
            Self::UnsupportedMethod { .. } => MSG_UNSUPPORTED_METHOD.to_string(),
            Self::MalformedTarget { target } => {
                format!("HTTPS tunnel failed: malformed target {target}")
            }
            Self::UpstreamConnect { reason, .. } => format!("HTTPS tunnel failed: {reason}"),
            Self::Fetch { reason, .. } => reason.clone(),
            Self::ConnectionLimit { .. } => "Connection limit reached".to_string(),
            other => other.to_string(),
        }
    }
}

/// Raw frame decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer too short for the header being decoded
    #[error("Frame too short: {len} bytes, need {needed}")]
    TooShort { len: usize, needed: usize },

    /// IP version nibble is not 4
    #[error("Unsupported IP version {0}")]
    UnsupportedVersion(u8),

    /// IHL below 20 bytes or beyond the buffer
    #[error("Invalid IPv4 header length {0}")]
    InvalidIpHeaderLength(usize),

    /// Transport protocol other than TCP
    #[error("Unsupported protocol {0}")]
    UnsupportedProtocol(u8),

    /// TCP data offset below 20 bytes or beyond the buffer
    #[error("Invalid TCP header length {0}")]
    InvalidTcpHeaderLength(usize),
}

impl PacketError {
    /// A bad frame never affects the next one
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

/// Tunnel bridge errors
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Platform refused to establish the virtual interface
    #[error("Failed to establish interface: {0}")]
    Interface(String),

    /// Interface read or write failed
    #[error("Interface I/O error: {0}")]
    InterfaceIo(#[source] io::Error),

    /// The protect callback declined the proxy socket
    #[error("Socket protection refused for fd {fd}")]
    ProtectRefused { fd: i32 },

    /// Could not reach the forwarding proxy
    #[error("Failed to connect to proxy {addr}: {reason}")]
    ProxyConnect { addr: SocketAddr, reason: String },

    /// Payload write or response read on the proxy connection failed
    #[error("Proxy exchange failed: {0}")]
    ProxyExchange(#[source] io::Error),

    /// Frame could not be decoded
    #[error("Frame error: {0}")]
    Frame(#[from] PacketError),

    /// Bridge already running or stopped
    #[error("Bridge is not in a runnable state: {0}")]
    State(String),
}

impl BridgeError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Interface(_) | Self::State(_) => false,
            Self::InterfaceIo(e) => is_transient_io(e),
            Self::ProtectRefused { .. }
            | Self::ProxyConnect { .. }
            | Self::ProxyExchange(_)
            | Self::Frame(_) => true,
        }
    }

    /// Create a proxy connect error
    pub fn proxy_connect(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::ProxyConnect {
            addr,
            reason: reason.into(),
        }
    }
}

/// Result type alias for tun-proxy operations
pub type Result<T> = std::result::Result<T, TunProxyError>;
