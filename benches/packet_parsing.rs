//! Performance benchmarks for the bridge's per-frame hot path.
//!
//! Run with: `cargo bench --bench packet_parsing`
//!
//! Every frame read from the interface is parsed, tracked and (when it has
//! payload) sniffed for an HTTP method before any socket is touched.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tun_proxy::packet::{parse_frame, tcp_flags, ConnectionTracker, TcpFlowKey, IPPROTO_TCP};
use tun_proxy::remap::{RemapRule, RemapTable};
use tun_proxy::sniff::{looks_like_http_request, parse_request_line, sniff_http_host};

// ============================================================================
// Test Data Generation
// ============================================================================

fn tcp_frame(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; 40];
    pkt[0] = 0x45;
    pkt[9] = IPPROTO_TCP;
    pkt[12..16].copy_from_slice(&[10, 0, 0, 2]);
    pkt[16..20].copy_from_slice(&[93, 184, 216, 34]);
    pkt[20..22].copy_from_slice(&40000u16.to_be_bytes());
    pkt[22..24].copy_from_slice(&80u16.to_be_bytes());
    pkt[32] = 0x50;
    pkt[33] = flags;
    pkt.extend_from_slice(payload);
    pkt
}

const REQUEST: &[u8] = b"GET /Items/42/Images/Primary HTTP/1.1\r\n\
Host: media.example.com\r\n\
User-Agent: bench\r\n\
Accept: */*\r\n\r\n";

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_parse_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_frame");

    let syn = tcp_frame(tcp_flags::SYN, &[]);
    group.bench_function("bare_syn", |b| b.iter(|| parse_frame(black_box(&syn))));

    for size in [64usize, 512, 1460] {
        let payload = vec![b'x'; size];
        let frame = tcp_frame(tcp_flags::ACK | tcp_flags::PSH, &payload);
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::new("payload", size), &frame, |b, frame| {
            b.iter(|| parse_frame(black_box(frame)).map(|f| f.payload_len));
        });
    }

    let mut udp = tcp_frame(0, &[]);
    udp[9] = 17;
    group.bench_function("non_tcp", |b| b.iter(|| parse_frame(black_box(&udp))));

    group.finish();
}

fn bench_tracker(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker");

    let tracker = ConnectionTracker::new(65536, true);
    group.bench_function("observe_syn", |b| {
        let mut port = 0u16;
        b.iter(|| {
            port = port.wrapping_add(1);
            tracker.observe(TcpFlowKey::new(black_box(port), 80), true, false)
        });
    });

    group.bench_function("observe_ack", |b| {
        b.iter(|| tracker.observe(TcpFlowKey::new(black_box(40000), 80), false, true));
    });

    group.finish();
}

fn bench_sniff(c: &mut Criterion) {
    let mut group = c.benchmark_group("sniff");

    group.bench_function("http_request", |b| {
        b.iter(|| looks_like_http_request(black_box(REQUEST)));
    });
    group.bench_function("tls_record", |b| {
        b.iter(|| looks_like_http_request(black_box(b"\x16\x03\x01\x02\x00\x01\x00\x01")));
    });
    group.bench_function("host_header", |b| {
        b.iter(|| sniff_http_host(black_box(REQUEST)));
    });
    group.bench_function("request_line", |b| {
        b.iter(|| parse_request_line(black_box("CONNECT media.example.com:443 HTTP/1.1\r\n")));
    });

    group.finish();
}

fn bench_remap(c: &mut Criterion) {
    let mut group = c.benchmark_group("remap");

    for count in [1usize, 16, 128] {
        let rules = (0..count)
            .map(|i| RemapRule {
                from: format!("http://host{i}.example/"),
                to: format!("http://10.0.0.{}/", i % 250),
            })
            .collect();
        let table = RemapTable::new(rules);
        let url = format!("http://host{}.example/Items/1", count - 1);

        group.bench_with_input(BenchmarkId::new("last_rule", count), &url, |b, url| {
            b.iter(|| table.apply(black_box(url)).len());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse_frame, bench_tracker, bench_sniff, bench_remap);
criterion_main!(benches);
