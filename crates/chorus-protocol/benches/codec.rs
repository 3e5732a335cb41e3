//! Codec benchmarks for chorus-protocol.

use chorus_protocol::{codec, Envelope};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

fn sample() -> Envelope {
    Envelope::new(
        "chat:send-message",
        json!({"roomId": "event-42", "content": "x".repeat(64), "mentions": ["u-1"]}),
    )
    .with_room("event-42")
}

fn bench_json(c: &mut Criterion) {
    let envelope = sample();
    let encoded = codec::encode_json(&envelope).unwrap();

    let mut group = c.benchmark_group("json");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode", |b| b.iter(|| codec::encode_json(black_box(&envelope))));
    group.bench_function("decode", |b| {
        b.iter(|| codec::decode_json(black_box(&encoded), codec::MAX_ENVELOPE_SIZE))
    });
    group.finish();
}

fn bench_msgpack(c: &mut Criterion) {
    let envelope = sample();
    let encoded = codec::encode_msgpack(&envelope).unwrap();

    let mut group = c.benchmark_group("msgpack");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode", |b| b.iter(|| codec::encode_msgpack(black_box(&envelope))));
    group.bench_function("decode", |b| {
        b.iter(|| codec::decode_msgpack(black_box(&encoded), codec::MAX_ENVELOPE_SIZE))
    });
    group.finish();
}

criterion_group!(benches, bench_json, bench_msgpack);
criterion_main!(benches);
