//! Throughput benchmarks for Chorus.
//!
//! These benchmarks measure room fan-out, membership churn and content
//! sanitization.

use chorus_bench::{connect, hub, populate};
use chorus_core::moderation::{plain_text, sanitize};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

/// Benchmark fan-out to rooms of increasing size.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for size in [10, 100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let hub = hub();
            let mut members = populate(&hub, "broadcast", size);
            let payload = json!({"roomId": "broadcast", "message": {"content": "x".repeat(64)}});

            b.iter(|| {
                let sent = hub.broadcast("broadcast", "chat:message-received", black_box(payload.clone()), None);
                for member in &mut members {
                    member.drain();
                }
                sent
            });
        });
    }

    group.finish();
}

/// Benchmark join and leave through the registry.
fn bench_membership(c: &mut Criterion) {
    let mut group = c.benchmark_group("membership");

    group.bench_function("join_leave", |b| {
        let hub = hub();
        let _crowd = populate(&hub, "lobby", 100);
        let mut member = connect(&hub, 100_000);
        b.iter(|| {
            let _ = hub.registry().join(&member.id, "lobby", |info| {
                chorus_protocol::Envelope::new("chat:room-joined", json!({"n": info.member_count}))
            });
            let _ = hub.registry().leave(&member.id, "lobby");
            member.drain();
        });
    });

    group.bench_function("room_info", |b| {
        let hub = hub();
        let _crowd = populate(&hub, "lobby", 1000);
        b.iter(|| hub.room_info(black_box("lobby")));
    });

    group.finish();
}

/// Benchmark the sanitizer on representative inputs.
fn bench_sanitize(c: &mut Criterion) {
    let mut group = c.benchmark_group("sanitize");

    let inputs = [
        ("plain", "Hello @B, see you at the keynote!".to_string()),
        ("markup", "<b>bold</b> and <i>italic</i> with <a href=\"x\">a link</a>".repeat(8)),
        ("script", "ignore <script>evil()</script> this message".repeat(8)),
    ];

    for (name, input) in &inputs {
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), input, |b, input| {
            b.iter(|| plain_text(&sanitize(black_box(input))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fanout, bench_membership, bench_sanitize);
criterion_main!(benches);
