//! I/O utilities for tun-proxy

mod copy;

pub use copy::{relay_bidirectional, CopyResult, DEFAULT_RELAY_BUFFER_SIZE, HALF_CLOSE_LINGER};
