//! Configuration types for tun-proxy
//!
//! Configuration is loaded from a JSON file, every field has a default, and
//! the whole tree is validated once at startup.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Forwarding proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Tunnel bridge settings
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// URL remap rules
    #[serde(default)]
    pub remap: RemapConfig,

    /// GET response cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy.validate()?;
        self.bridge.validate()?;
        self.cache.validate()?;
        self.log.validate()?;
        Ok(())
    }

    /// Create the default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }
}

/// Forwarding proxy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Listen address, loopback by default
    #[serde(default = "default_proxy_listen")]
    pub listen: SocketAddr,

    /// TCP accept backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Maximum concurrent client sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Buffer size for each CONNECT relay direction
    #[serde(default = "default_relay_buffer_size")]
    pub relay_buffer_size: usize,

    /// Connect timeout for CONNECT targets and GET origins (0 disables)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl ProxyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 {
            return Err(ConfigError::ValidationError(
                "proxy.backlog must be greater than 0".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "proxy.max_connections must be greater than 0".into(),
            ));
        }
        if self.relay_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "proxy.relay_buffer_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Connect timeout, `None` when disabled
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_secs > 0).then(|| Duration::from_secs(self.connect_timeout_secs))
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_proxy_listen(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            relay_buffer_size: default_relay_buffer_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Tunnel bridge configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Run the bridge (needs an interface from the host platform)
    #[serde(default)]
    pub enabled: bool,

    /// Session name shown by the platform
    #[serde(default = "default_session_name")]
    pub session_name: String,

    /// Local interface address
    #[serde(default = "default_interface_address")]
    pub address: Ipv4Addr,

    /// Prefix length of the local address
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    /// Captured routes in CIDR notation
    #[serde(default = "default_routes")]
    pub routes: Vec<String>,

    /// DNS server override
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<Ipv4Addr>,

    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Identifier of the hosting application, always captured
    #[serde(default = "default_application_id")]
    pub application_id: String,

    /// Additional applications whose traffic is captured
    #[serde(default = "default_allowed_applications")]
    pub allowed_applications: Vec<String>,

    /// Address of the forwarding proxy the bridge dials
    ///
    /// Unset means the proxy's own bound address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_addr: Option<SocketAddr>,

    /// Frame read buffer size
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Upper bound on tracked flows (0 = unbounded)
    #[serde(default = "default_max_tracked_flows")]
    pub max_tracked_flows: usize,

    /// Forget a flow when FIN or RST is seen
    #[serde(default = "default_true")]
    pub evict_on_close: bool,

    /// Limit on one proxy exchange (connect, write, read) in seconds, 0 = none
    #[serde(default = "default_connect_timeout_secs")]
    pub exchange_timeout_secs: u64,

    /// Firewall mark set on proxy sockets instead of a host callback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protect_mark: Option<u32>,
}

impl BridgeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.prefix_len > 32 {
            return Err(ConfigError::ValidationError(format!(
                "bridge.prefix_len {} exceeds 32",
                self.prefix_len
            )));
        }
        if !(576..=65535).contains(&self.mtu) {
            return Err(ConfigError::ValidationError(format!(
                "bridge.mtu {} out of range 576..=65535",
                self.mtu
            )));
        }
        if self.read_buffer_size < 40 {
            return Err(ConfigError::ValidationError(
                "bridge.read_buffer_size must hold at least an IPv4 and TCP header".into(),
            ));
        }
        for route in &self.routes {
            parse_cidr(route)?;
        }
        if self.enabled && self.application_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "bridge.application_id is required when the bridge is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Proxy exchange limit, `None` when disabled
    #[must_use]
    pub fn exchange_timeout(&self) -> Option<Duration> {
        (self.exchange_timeout_secs > 0).then(|| Duration::from_secs(self.exchange_timeout_secs))
    }

    /// Point the bridge at the running proxy unless an address was set
    ///
    /// A wildcard bind is dialed over loopback. Returns the address the
    /// bridge will dial.
    pub fn follow_proxy(&mut self, bound: SocketAddr) -> SocketAddr {
        *self.proxy_addr.get_or_insert_with(|| {
            let mut addr = bound;
            if addr.ip().is_unspecified() {
                addr.set_ip(match addr {
                    SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                    SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
                });
            }
            addr
        })
    }

    /// Address the bridge dials
    #[must_use]
    pub fn dial_addr(&self) -> SocketAddr {
        self.proxy_addr.unwrap_or_else(default_proxy_listen)
    }

    /// Hosting application followed by the extra allowed applications
    #[must_use]
    pub fn captured_applications(&self) -> Vec<String> {
        let mut apps = vec![self.application_id.clone()];
        for app in &self.allowed_applications {
            if !apps.contains(app) {
                apps.push(app.clone());
            }
        }
        apps
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            session_name: default_session_name(),
            address: default_interface_address(),
            prefix_len: default_prefix_len(),
            routes: default_routes(),
            dns_servers: default_dns_servers(),
            mtu: default_mtu(),
            application_id: default_application_id(),
            allowed_applications: default_allowed_applications(),
            proxy_addr: None,
            read_buffer_size: default_read_buffer_size(),
            max_tracked_flows: default_max_tracked_flows(),
            evict_on_close: true,
            exchange_timeout_secs: default_connect_timeout_secs(),
            protect_mark: None,
        }
    }
}

/// Parse an IPv4 CIDR such as `0.0.0.0/0`
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` for a bad address or prefix.
pub fn parse_cidr(s: &str) -> Result<(Ipv4Addr, u8), ConfigError> {
    let invalid = || ConfigError::ValidationError(format!("Invalid route: {s}"));
    let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }
    Ok((addr, prefix))
}

/// Remap rule sources
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RemapConfig {
    /// Path to a `map <from> <to>` rules file, read once at startup
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Inline rules, checked before rules from the file
    #[serde(default)]
    pub rules: Vec<RemapRuleConfig>,
}

/// A single inline remap rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemapRuleConfig {
    /// Source URL prefix
    pub from: String,
    /// Destination URL prefix
    pub to: String,
}

/// GET response cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Enable the cache
    #[serde(default)]
    pub enabled: bool,

    /// Entry lifetime in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Maximum number of cached responses
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: u64,

    /// Responses with larger bodies are not cached
    #[serde(default = "default_cache_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl CacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "cache.ttl_secs must be greater than 0 when the cache is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Entry lifetime
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
            max_body_bytes: default_cache_max_body_bytes(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the module target
    #[serde(default)]
    pub target: bool,
}

impl LogConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::ValidationError(format!(
                "Unknown log level: {}",
                self.level
            )));
        }
        if !matches!(self.format.as_str(), "json" | "text") {
            return Err(ConfigError::ValidationError(format!(
                "Unknown log format: {}",
                self.format
            )));
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamps: true,
            target: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

fn default_proxy_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

const fn default_backlog() -> u32 {
    1024
}

const fn default_max_connections() -> usize {
    1024
}

const fn default_relay_buffer_size() -> usize {
    8 * 1024
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_session_name() -> String {
    "tun-proxy".into()
}

const fn default_interface_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 2)
}

const fn default_prefix_len() -> u8 {
    24
}

fn default_routes() -> Vec<String> {
    vec!["0.0.0.0/0".into()]
}

fn default_dns_servers() -> Vec<Ipv4Addr> {
    vec![Ipv4Addr::new(8, 8, 8, 8)]
}

const fn default_mtu() -> u16 {
    1500
}

fn default_application_id() -> String {
    "tun-proxy".into()
}

fn default_allowed_applications() -> Vec<String> {
    vec!["org.jellyfin.mobile".into()]
}

const fn default_read_buffer_size() -> usize {
    32767
}

const fn default_max_tracked_flows() -> usize {
    65536
}

const fn default_cache_ttl_secs() -> u64 {
    60
}

const fn default_cache_max_entries() -> u64 {
    256
}

const fn default_cache_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
