//! Configuration module for tun-proxy
//!
//! # Example
//!
//! ```no_run
//! use tun_proxy::config::load_config;
//!
//! let config = load_config("/etc/tun-proxy/config.json").unwrap();
//! println!("Proxy listens on {}", config.proxy.listen);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    parse_cidr, BridgeConfig, CacheConfig, Config, LogConfig, ProxyConfig, RemapConfig,
    RemapRuleConfig,
};
