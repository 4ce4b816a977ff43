// Benchmark for stream transport throughput over loopback
// Run with: cargo bench

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use hostmock_rs::config::{DatagramConfig, StreamConfig};
use hostmock_rs::net::{DatagramContext, StreamTransport};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::thread;

const CHUNK: usize = 64 * 1024;

fn bench_stream_read(c: &mut Criterion) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = StreamConfig {
        buffer_capacity: 16 * 1024,
        ..StreamConfig::default()
    };
    let mut transport = StreamTransport::connect("127.0.0.1", port, &config).unwrap();
    let (mut remote, _) = listener.accept().unwrap();

    // Writer keeps the pipe full; the benchmark measures the read side.
    thread::spawn(move || {
        let chunk = vec![0x5au8; CHUNK];
        while remote.write_all(&chunk).is_ok() {}
    });

    let mut group = c.benchmark_group("stream");
    group.throughput(Throughput::Bytes(CHUNK as u64));
    let mut dst = vec![0u8; CHUNK];
    group.bench_function("read 64k through 16k buffer", |b| {
        b.iter(|| {
            let n = transport.read(&mut dst, 1000).unwrap();
            assert_eq!(n, CHUNK);
        });
    });
    group.finish();
}

fn bench_datagram_round_trip(c: &mut Criterion) {
    let config = DatagramConfig::default();
    let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let a = DatagramContext::new(&config);
    let b = DatagramContext::new(&config);
    a.listen(localhost, 0, None).unwrap();
    b.listen(localhost, 0, None).unwrap();
    let b_addr = b.local_addr().unwrap().unwrap();
    let payload = [0xa5u8; 512];

    c.bench_function("datagram append + send + next (512 B)", |bench| {
        bench.iter(|| {
            a.append(&payload).unwrap();
            a.send(Some(b_addr)).unwrap();
            while !b.next().unwrap() {
                std::hint::spin_loop();
            }
            assert_eq!(b.len(), payload.len());
        });
    });
}

criterion_group!(benches, bench_stream_read, bench_datagram_round_trip);
criterion_main!(benches);
