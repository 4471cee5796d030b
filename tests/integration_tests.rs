//! Integration test suite entry point
//!
//! All test modules are organized under `tests/integration/`.
//!
//! # Running Integration Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test --test integration_tests
//!
//! # Run a specific test module
//! cargo test --test integration_tests bridge
//! ```

mod integration;
