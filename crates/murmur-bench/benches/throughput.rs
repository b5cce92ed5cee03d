//! Throughput benchmarks for Murmur.
//!
//! These benchmarks measure the raw message throughput of the codec, the
//! bus and the router.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use murmur_bench::room_with_members;
use murmur_bus::{Bus, LocalBus};
use murmur_protocol::{codec, Message, MessageKind, Peer};

fn message(body_len: usize) -> Message {
    Message::new(MessageKind::RoomMessage)
        .with_from(Peer::new("user-1", "alice"))
        .with_to(Peer::new("room-1", "default"))
        .with_body("x".repeat(body_len))
}

/// Benchmark message encoding.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for (label, size) in [("64B", 64), ("1KB", 1024), ("64KB", 65536)] {
        let msg = message(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(label, |b| b.iter(|| codec::encode(black_box(&msg))));
    }

    group.finish();
}

/// Benchmark message decoding.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for (label, size) in [("64B", 64), ("1KB", 1024), ("64KB", 65536)] {
        let encoded = codec::encode(&message(size)).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_function(label, |b| b.iter(|| codec::decode(black_box(&encoded))));
    }

    group.finish();
}

/// Benchmark publishing to a topic with many subscribers.
fn bench_bus_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus_fanout");
    let payload = codec::encode(&message(64)).unwrap();

    for subscribers in [1, 10, 100, 1000] {
        let bus = LocalBus::with_capacity(16);
        let _inbound: Vec<_> = (0..subscribers)
            .map(|_| bus.subscribe("room-1").unwrap())
            .collect();

        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(subscribers), &subscribers, |b, _| {
            b.iter(|| bus.publish("room-1", black_box(Bytes::clone(&payload))))
        });
    }

    group.finish();
}

/// Benchmark routing a room message to a populated room.
fn bench_room_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("room_message");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for members in [1, 10, 100] {
        let fixture = {
            let _enter = rt.enter();
            room_with_members(members)
        };
        let sender = fixture.sessions[0].clone();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, _| {
            b.iter(|| {
                fixture
                    .chat
                    .process(black_box(fixture.room_message("hello everyone")), &sender)
            })
        });

        for session in &fixture.sessions {
            fixture.chat.close(session);
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_bus_fanout,
    bench_room_message,
);
criterion_main!(benches);
