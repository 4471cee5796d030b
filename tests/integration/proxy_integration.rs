//! Forwarding proxy integration tests
//!
//! Each test binds a proxy on an ephemeral loopback port and drives it with
//! plain TCP clients, so the bytes on the wire are checked exactly.
//!
//! # Test Categories
//!
//! 1. **Tunnel Tests**: CONNECT establishment and opaque relay
//! 2. **Forwarding Tests**: GET through a mock origin, remap and cache
//! 3. **Error Tests**: structured 500 responses
//! 4. **Lifecycle Tests**: stop semantics

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use tun_proxy::config::{Config, RemapRuleConfig};
use tun_proxy::proxy::{build_proxy, error_response, ProxyHandle, CONNECT_ESTABLISHED};

// ============================================================================
// Helpers
// ============================================================================

fn test_config() -> Config {
    let mut config = Config::default();
    config.proxy.listen = "127.0.0.1:0".parse().unwrap();
    config.proxy.connect_timeout_secs = 2;
    config
}

fn start_proxy(config: &Config) -> (ProxyHandle, JoinHandle<()>) {
    build_proxy(config).expect("proxy binds").spawn()
}

/// Echo server for a single connection
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });
    addr
}

/// Origin answering every request with `response`, counting requests
async fn spawn_origin(response: &'static [u8]) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (addr, hits)
}

async fn roundtrip(proxy: SocketAddr, request: &str) -> String {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .expect("proxy closes the session")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

// ============================================================================
// Tunnel Tests
// ============================================================================

#[tokio::test]
async fn test_connect_tunnel_relays_both_ways() {
    let echo = spawn_echo().await;
    let (proxy, _task) = start_proxy(&test_config());

    let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
    client
        .write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut reply = vec![0u8; CONNECT_ESTABLISHED.len()];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, CONNECT_ESTABLISHED);

    for msg in [&b"ping"[..], b"\x16\x03\x01 binary \x00\xff"] {
        client.write_all(msg).await.unwrap();
        let mut echoed = vec![0u8; msg.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, msg);
    }

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    for _ in 0..50 {
        if proxy.stats().snapshot().tunnels == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let stats = proxy.stats().snapshot();
    assert_eq!(stats.tunnels, 1);
    assert!(stats.bytes_up >= 4);

    proxy.stop();
}

#[tokio::test]
async fn test_tunnel_ends_when_client_leaves_and_upstream_lingers() {
    // Upstream accepts and then sits on the socket, ignoring any FIN
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(stream);
    });
    let (proxy, _task) = start_proxy(&test_config());

    let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
    client
        .write_all(format!("CONNECT {upstream} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut reply = vec![0u8; CONNECT_ESTABLISHED.len()];
    client.read_exact(&mut reply).await.unwrap();
    drop(client);

    for _ in 0..100 {
        if proxy.stats().active() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(proxy.stats().active(), 0);
    assert_eq!(proxy.stats().snapshot().tunnels, 1);

    proxy.stop();
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (proxy, _task) = start_proxy(&test_config());

    let response = roundtrip(
        proxy.local_addr(),
        &format!("CONNECT {closed} HTTP/1.1\r\n\r\n"),
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(response.contains("\r\n\r\nHTTPS tunnel failed: "));

    proxy.stop();
}

// ============================================================================
// Forwarding Tests
// ============================================================================

#[tokio::test]
async fn test_get_forwarded_from_origin() {
    let (origin, hits) = spawn_origin(
        b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\nX-Origin: mock\r\nConnection: close\r\n\r\nhello world",
    )
    .await;
    let (proxy, _task) = start_proxy(&test_config());

    let response = roundtrip(
        proxy.local_addr(),
        &format!("GET http://{origin}/index.html HTTP/1.1\r\nHost: {origin}\r\n\r\n"),
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200\r\n"), "{response}");
    assert!(response.contains("x-origin: mock\r\n"));
    assert!(response.contains("Via: 1.1 tun-proxy\r\n"));
    assert!(response.ends_with("\r\n\r\nhello world"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    proxy.stop();
}

#[tokio::test]
async fn test_get_remapped_and_cached() {
    let (origin, hits) = spawn_origin(
        b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nmeta",
    )
    .await;

    let mut config = test_config();
    config.remap.rules.push(RemapRuleConfig {
        from: "http://media.invalid/".into(),
        to: format!("http://{origin}/"),
    });
    config.cache.enabled = true;
    let (proxy, _task) = start_proxy(&config);

    let request = "GET http://media.invalid/Items/1 HTTP/1.1\r\nHost: media.invalid\r\n\r\n";

    let first = roundtrip(proxy.local_addr(), request).await;
    assert!(first.contains("X-Cache: MISS\r\n"), "{first}");
    assert!(first.ends_with("meta"));

    let second = roundtrip(proxy.local_addr(), request).await;
    assert!(second.contains("X-Cache: HIT\r\n"), "{second}");
    assert_eq!(second.matches("Via: 1.1 tun-proxy\r\n").count(), 1);
    assert!(second.ends_with("meta"));

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    proxy.stop();
}

// ============================================================================
// Error Tests
// ============================================================================

#[tokio::test]
async fn test_unsupported_method_exact_bytes() {
    let (proxy, _task) = start_proxy(&test_config());

    let response = roundtrip(proxy.local_addr(), "FOO bar HTTP/1.1\r\n\r\n").await;
    let expected = error_response("Only GET and CONNECT methods are supported");
    assert_eq!(response.as_bytes(), expected.as_slice());
    assert!(response.contains("Content-Length: 42\r\n"));

    proxy.stop();
}

#[tokio::test]
async fn test_short_request_line() {
    let (proxy, _task) = start_proxy(&test_config());

    let response = roundtrip(proxy.local_addr(), "GET /only\r\n\r\n").await;
    assert!(response.ends_with("\r\n\r\nInvalid request format"));

    proxy.stop();
}

#[tokio::test]
async fn test_unreachable_origin_reports_error() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (proxy, _task) = start_proxy(&test_config());

    let response = roundtrip(
        proxy.local_addr(),
        &format!("GET http://{closed}/ HTTP/1.1\r\n\r\n"),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(response.contains("Content-Type: text/plain\r\n"));

    proxy.stop();
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_stop_twice_and_listener_closed() {
    let (proxy, task) = start_proxy(&test_config());
    let addr = proxy.local_addr();

    // Sessions are served before the stop
    let response = roundtrip(addr, "FOO bar HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 500"));

    assert!(proxy.stop());
    assert!(!proxy.stop());
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("serve returns")
        .unwrap();
    assert!(!proxy.stop());

    assert!(TcpStream::connect(addr).await.is_err());
}
