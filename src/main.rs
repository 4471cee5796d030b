//! tun-proxy: forwarding HTTP/HTTPS proxy with a TUN packet bridge
//!
//! # Usage
//!
//! ```bash
//! # Run the proxy with default configuration
//! ./tun-proxy
//!
//! # Run with a custom configuration
//! ./tun-proxy -c /path/to/config.json
//!
//! # Bridge a TUN descriptor handed over by the host
//! ./tun-proxy -c config.json --tun-fd 3
//!
//! # Run with environment overrides
//! TUN_PROXY_LOG_LEVEL=debug ./tun-proxy
//! ```

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use tun_proxy::bridge::{
    BridgeHandle, FdInterfaceProvider, MarkProtector, NoopProtector, SocketProtector, TunnelBridge,
};
use tun_proxy::config::{load_config_with_env, LogConfig};
use tun_proxy::error::BridgeError;
use tun_proxy::proxy::build_proxy;

/// How long to wait for the proxy and bridge tasks after stopping them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
    /// Listen address override
    listen: Option<SocketAddr>,
    /// Host-established TUN descriptor
    tun_fd: Option<RawFd>,
    /// Firewall mark for the bridge's proxy sockets
    protect_mark: Option<u32>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/tun-proxy/config.json");
        let mut generate_config = false;
        let mut check_config = false;
        let mut listen = None;
        let mut tun_fd = None;
        let mut protect_mark = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "--listen" => {
                    listen = Some(parse_value(&arg, args.next()));
                }
                "--tun-fd" => {
                    tun_fd = Some(parse_value(&arg, args.next()));
                }
                "--protect-mark" => {
                    protect_mark = Some(parse_mark(&arg, args.next()));
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("tun-proxy v{}", tun_proxy::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
            listen,
            tun_fd,
            protect_mark,
        }
    }
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<String>) -> T {
    match value.as_deref().map(str::parse) {
        Some(Ok(v)) => v,
        _ => {
            eprintln!("Invalid or missing value for {flag}");
            print_help();
            std::process::exit(1);
        }
    }
}

/// Decimal or `0x`-prefixed hexadecimal mark
fn parse_mark(flag: &str, value: Option<String>) -> u32 {
    let parsed = value.as_deref().and_then(|v| match v.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => v.parse().ok(),
    });
    parsed.unwrap_or_else(|| {
        eprintln!("Invalid or missing value for {flag}");
        print_help();
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"tun-proxy v{}

Forwarding HTTP/HTTPS proxy with a TUN packet bridge.

USAGE:
    tun-proxy [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/tun-proxy/config.json]
    -g, --generate-config   Write the default configuration to the config path and exit
    --check                 Check configuration and exit
    --listen <ADDR>         Override the proxy listen address
    --tun-fd <FD>           Run the bridge on an already established TUN descriptor
    --protect-mark <MARK>   Protect bridge sockets with this SO_MARK (needs CAP_NET_ADMIN)
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    TUN_PROXY_LISTEN               Override listen address
    TUN_PROXY_LOG_LEVEL            Override log level (trace, debug, info, warn, error)
    TUN_PROXY_BRIDGE_PROXY_ADDR    Override the proxy address the bridge dials

EXAMPLE:
    tun-proxy -c /etc/tun-proxy/config.json
    curl -x http://127.0.0.1:8080 http://example.com/
"#,
        tun_proxy::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &LogConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn", "rustls=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.target);

    match (config.format.as_str(), config.timestamps) {
        ("json", true) => subscriber.json().init(),
        ("json", false) => subscriber.json().without_time().init(),
        (_, true) => subscriber.init(),
        (_, false) => subscriber.without_time().init(),
    }
}

/// Start the bridge on the host's descriptor
fn start_bridge(
    fd: RawFd,
    config: &tun_proxy::BridgeConfig,
) -> Result<(BridgeHandle, JoinHandle<Result<(), BridgeError>>)> {
    // SAFETY: the descriptor was handed to this process on the command line
    // and stays open for its lifetime
    let provider = unsafe { FdInterfaceProvider::new(fd) };
    let protector: Arc<dyn SocketProtector> = match config.protect_mark {
        Some(mark) => {
            info!(mark, "Protecting proxy sockets with a firewall mark");
            Arc::new(MarkProtector::new(mark))
        }
        None => Arc::new(NoopProtector),
    };
    let bridge = TunnelBridge::establish(&provider, config, protector)
        .context("Failed to establish the tunnel interface")?;

    let handle = bridge.handle();
    let task = tokio::spawn(async move {
        let result = bridge.run().await;
        if let Err(e) = &result {
            error!(error = %e, "Tunnel bridge failed");
        }
        result
    });
    Ok((handle, task))
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    // Parse arguments
    let args = Args::parse();

    // Handle generate-config
    if args.generate_config {
        tun_proxy::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    // Load configuration
    let mut config = load_config_with_env(&args.config_path).with_context(|| {
        format!("Failed to load configuration from {:?}", args.config_path)
    })?;
    if let Some(listen) = args.listen {
        config.proxy.listen = listen;
    }
    if args.tun_fd.is_some() {
        config.bridge.enabled = true;
    }
    if args.protect_mark.is_some() {
        config.bridge.protect_mark = args.protect_mark;
    }

    // Handle check-config
    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    // Initialize logging
    init_logging(&config.log);

    info!("tun-proxy v{}", tun_proxy::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let server = build_proxy(&config).context("Failed to start the proxy")?;
    let (proxy, proxy_task) = server.spawn();

    let dial = config.bridge.follow_proxy(proxy.local_addr());
    let bridge = match (config.bridge.enabled, args.tun_fd) {
        (true, Some(fd)) => {
            info!(proxy = %dial, "Bridge dials the proxy");
            Some(start_bridge(fd, &config.bridge)?)
        }
        (true, None) => {
            proxy.stop();
            bail!("bridge.enabled requires --tun-fd");
        }
        (false, _) => None,
    };

    info!(
        listen = %proxy.local_addr(),
        bridge = bridge.is_some(),
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Graceful shutdown
    info!("Shutting down...");

    if let Some((handle, task)) = bridge {
        handle.stop();
        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "Bridge ended with an error"),
            Ok(Err(e)) => warn!(error = %e, "Bridge task panicked"),
            Err(_) => warn!("Bridge did not stop in time"),
        }

        let stats = handle.stats().snapshot();
        info!(
            "Final bridge stats: {} frames, {} forwarded, {} handshakes, {} dropped, {} failed",
            stats.frames_read, stats.forwarded, stats.handshakes, stats.dropped, stats.failed
        );
    }

    proxy.stop();
    if tokio::time::timeout(SHUTDOWN_GRACE, proxy_task).await.is_err() {
        warn!("Proxy did not stop in time");
    }

    let stats = proxy.stats().snapshot();
    info!(
        "Final proxy stats: {} accepted, {} tunnels, {} forwards, {} errors, {} rejected",
        stats.accepted, stats.tunnels, stats.forwards, stats.errors, stats.rejected
    );
    info!(
        "Transferred: {} bytes up, {} bytes down",
        stats.bytes_up, stats.bytes_down
    );

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await;
}
