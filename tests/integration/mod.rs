//! Integration tests for tun-proxy
//!
//! # Test Organization
//!
//! - `proxy_integration`: forwarding proxy over real sockets with mock
//!   origins (CONNECT tunnels, GET forwarding, structured errors, stop)
//! - `bridge_integration`: tunnel bridge over an in-memory interface feeding
//!   a running proxy or a stub proxy
//!
//! # Test Requirements
//!
//! All tests use loopback mock servers and need no network access or
//! privileges.

pub mod bridge_integration;
pub mod proxy_integration;
