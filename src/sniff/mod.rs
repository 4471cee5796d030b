//! Protocol sniffing module
//!
//! Detects HTTP requests at the start of raw TCP payloads and parses the
//! request line of proxy client sessions.

pub mod http;

pub use http::{
    looks_like_http_request, parse_request_line, sniff_http_host, Method, ParsedRequestLine,
};
