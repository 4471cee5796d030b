//! Tunnel bridge integration tests
//!
//! The bridge runs over a [`MemoryInterface`]; frames are injected through
//! the peer and whatever the bridge writes back is read from it.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use tun_proxy::bridge::{
    FrameOutcome, InterfaceConfig, MemoryInterface, MemoryPeer, NoopProtector, SocketProtector,
    TunnelBridge, VirtualInterface,
};
use tun_proxy::config::{BridgeConfig, Config};
use tun_proxy::error::BridgeError;
use tun_proxy::packet::{tcp_flags, ConnectionTracker, TcpFlowKey, IPPROTO_TCP};
use tun_proxy::proxy::build_proxy;

// ============================================================================
// Helpers
// ============================================================================

/// IPv4/TCP frame from 10.0.0.2:`src_port` to 93.184.216.34:80
fn tcp_frame(src_port: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; 40];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&u16::try_from(40 + payload.len()).unwrap().to_be_bytes());
    pkt[8] = 64;
    pkt[9] = IPPROTO_TCP;
    pkt[12..16].copy_from_slice(&[10, 0, 0, 2]);
    pkt[16..20].copy_from_slice(&[93, 184, 216, 34]);
    pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
    pkt[22..24].copy_from_slice(&80u16.to_be_bytes());
    pkt[32] = 0x50;
    pkt[33] = flags;
    pkt.extend_from_slice(payload);
    pkt
}

/// Proxy stand-in answering each connection with `reply`, recording requests
async fn stub_proxy(reply: &'static [u8]) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(reply).await;
            });
        }
    });
    (addr, connections)
}

fn bridge_over(
    proxy_addr: SocketAddr,
    protector: Arc<dyn SocketProtector>,
) -> (Arc<TunnelBridge>, Arc<MemoryInterface>, MemoryPeer) {
    let (iface, peer) = MemoryInterface::pair(16);
    let config = BridgeConfig {
        proxy_addr: Some(proxy_addr),
        exchange_timeout_secs: 5,
        ..BridgeConfig::default()
    };
    let bridge = TunnelBridge::new(
        Arc::clone(&iface) as Arc<dyn VirtualInterface>,
        ConnectionTracker::new(config.max_tracked_flows, config.evict_on_close),
        protector,
        &config,
    );
    (Arc::new(bridge), iface, peer)
}

async fn next_written(peer: &mut MemoryPeer) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(5), peer.written.recv())
        .await
        .expect("bridge writes a response frame")
        .expect("interface open")
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_canned_response_reaches_interface_unmodified() {
    const CANNED: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc";
    let (proxy, connections) = stub_proxy(CANNED).await;
    let (bridge, _iface, mut peer) = bridge_over(proxy, Arc::new(NoopProtector));

    let runner = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.run().await })
    };

    // Handshake first, then the request segment on the same flow
    peer.inject
        .send(tcp_frame(40000, tcp_flags::SYN, &[]))
        .await
        .unwrap();
    peer.inject
        .send(tcp_frame(
            40000,
            tcp_flags::ACK | tcp_flags::PSH,
            b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
        ))
        .await
        .unwrap();

    assert_eq!(next_written(&mut peer).await, CANNED);
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert!(bridge.tracker().contains(&TcpFlowKey::new(40000, 80)));

    let handle = bridge.handle();
    assert!(handle.stop());
    runner.await.unwrap().unwrap();

    let stats = handle.stats().snapshot();
    assert_eq!(stats.handshakes, 1);
    assert_eq!(stats.forwarded, 1);
    assert_eq!(stats.bytes_from_proxy, CANNED.len() as u64);
}

#[tokio::test]
async fn test_non_http_and_non_tcp_frames_never_dial() {
    let (proxy, connections) = stub_proxy(b"unused").await;
    let (bridge, _iface, _peer) = bridge_over(proxy, Arc::new(NoopProtector));

    let mut udp = tcp_frame(40000, 0, b"GET / HTTP/1.1\r\n\r\n");
    udp[9] = 17;
    for frame in [
        udp,
        tcp_frame(40000, tcp_flags::ACK, &[]),
        tcp_frame(40000, tcp_flags::ACK, b"SSH-2.0-OpenSSH_9.6\r\n"),
        vec![0x45, 0, 0],
    ] {
        let outcome = bridge.process_frame(&frame).await.unwrap();
        assert!(matches!(outcome, FrameOutcome::Dropped(_)), "{outcome:?}");
    }

    assert_eq!(connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_bridge_through_running_proxy() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2048];
        let _ = stream.read(&mut buf).await;
        let _ = stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await;
    });

    let mut config = Config::default();
    config.proxy.listen = "127.0.0.1:0".parse().unwrap();
    let (proxy, _task) = build_proxy(&config).unwrap().spawn();

    let (bridge, _iface, mut peer) = bridge_over(proxy.local_addr(), Arc::new(NoopProtector));
    let request = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    let outcome = bridge
        .process_frame(&tcp_frame(40100, tcp_flags::ACK | tcp_flags::PSH, request.as_bytes()))
        .await
        .unwrap();

    assert!(matches!(outcome, FrameOutcome::Forwarded { .. }));
    let written = next_written(&mut peer).await;
    assert!(written.starts_with(b"HTTP/1.1 200"));

    for _ in 0..50 {
        if proxy.stats().snapshot().forwards == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(proxy.stats().snapshot().forwards, 1);

    proxy.stop();
}

#[tokio::test]
async fn test_bridge_follows_overridden_listen_address() {
    let mut config = Config::default();
    config.proxy.listen = "127.0.0.1:0".parse().unwrap();
    let (proxy, _task) = build_proxy(&config).unwrap().spawn();
    assert_ne!(proxy.local_addr().port(), 8080);

    let dialed = config.bridge.follow_proxy(proxy.local_addr());
    assert_eq!(dialed, proxy.local_addr());

    let (iface, mut peer) = MemoryInterface::pair(4);
    let bridge = TunnelBridge::new(
        iface as Arc<dyn VirtualInterface>,
        ConnectionTracker::unbounded(),
        Arc::new(NoopProtector),
        &config.bridge,
    );

    // Any proxy reply proves the bridge reached the bound port
    let outcome = bridge
        .process_frame(&tcp_frame(40200, tcp_flags::ACK, b"DELETE / HTTP/1.1\r\n\r\n"))
        .await;
    assert!(outcome.is_ok(), "{outcome:?}");
    let written = next_written(&mut peer).await;
    assert!(written.starts_with(b"HTTP/1.1 500"));

    proxy.stop();
}

#[tokio::test]
async fn test_protect_called_for_each_dial() {
    let (proxy, _) = stub_proxy(b"HTTP/1.1 204 No Content\r\n\r\n").await;
    let calls = Arc::new(AtomicUsize::new(0));
    let protector: Arc<dyn SocketProtector> = {
        let calls = Arc::clone(&calls);
        Arc::new(move |_fd: RawFd| {
            calls.fetch_add(1, Ordering::SeqCst);
            true
        })
    };
    let (bridge, _iface, mut peer) = bridge_over(proxy, protector);

    for port in [41000, 41001] {
        bridge
            .process_frame(&tcp_frame(port, tcp_flags::ACK, b"HEAD / HTTP/1.1\r\n\r\n"))
            .await
            .unwrap();
        next_written(&mut peer).await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_stop_twice_closes_interface() {
    let (proxy, _) = stub_proxy(b"").await;
    let (bridge, iface, _peer) = bridge_over(proxy, Arc::new(NoopProtector));
    let handle = bridge.handle();

    let runner = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.run().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(handle.stop());
    assert!(!handle.stop());
    assert!(!bridge.stop());

    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run returns after stop")
        .unwrap()
        .unwrap();
    assert!(iface.is_closed());
    assert!(matches!(bridge.run().await, Err(BridgeError::State(_))));
}

#[tokio::test]
async fn test_establish_passes_interface_settings() {
    let (iface, _peer) = MemoryInterface::pair(1);
    let seen = Arc::new(parking_lot::Mutex::new(None));
    let provider = {
        let seen = Arc::clone(&seen);
        move |config: &InterfaceConfig| -> Result<Arc<dyn VirtualInterface>, BridgeError> {
            *seen.lock() = Some(config.clone());
            Ok(Arc::clone(&iface) as Arc<dyn VirtualInterface>)
        }
    };

    let config = BridgeConfig {
        application_id: "com.example.host".into(),
        ..BridgeConfig::default()
    };
    TunnelBridge::establish(&provider, &config, Arc::new(NoopProtector)).unwrap();

    let seen = seen.lock().clone().expect("provider called");
    assert_eq!(seen.address.to_string(), "10.0.0.2");
    assert_eq!(seen.prefix_len, 24);
    assert_eq!(seen.mtu, 1500);
    assert_eq!(
        seen.allowed_applications,
        vec!["com.example.host".to_string(), "org.jellyfin.mobile".to_string()]
    );
}
