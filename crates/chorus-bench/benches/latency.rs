//! Latency benchmarks for Chorus.
//!
//! These benchmarks measure a full inbound dispatch until the other room
//! members hold the resulting event.

use chorus_bench::{hub, populate};
use chorus_protocol::Envelope;
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::time::{Duration, Instant};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Benchmark send-message dispatch to delivery.
fn bench_send_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("send_latency");

    for size in [2usize, 50] {
        group.bench_function(format!("{size}_members"), |b| {
            let rt = runtime();
            b.iter_custom(|iters| {
                // A fresh hub per sample keeps the send rate limit out of the way.
                let mut total = Duration::ZERO;
                let mut remaining = iters;
                while remaining > 0 {
                    let batch = remaining.min(25);
                    remaining -= batch;

                    let hub = hub();
                    let mut members = populate(&hub, "lobby", size);
                    let sender = members[0].id.clone();

                    let start = Instant::now();
                    rt.block_on(async {
                        for _ in 0..batch {
                            let envelope = Envelope::new(
                                "chat:send-message",
                                json!({"roomId": "lobby", "content": "ping"}),
                            );
                            let _ = hub.dispatch(&sender, envelope).await;
                            for member in &mut members[1..] {
                                let _ = member.rx.recv().await;
                            }
                        }
                    });
                    total += start.elapsed();
                }
                total
            });
        });
    }

    group.finish();
}

/// Benchmark typing indicators, which bypass the store.
fn bench_typing_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("typing_latency");

    group.bench_function("start_stop", |b| {
        let rt = runtime();
        let hub = hub();
        let mut members = populate(&hub, "lobby", 10);
        let sender = members[0].id.clone();

        b.iter(|| {
            rt.block_on(async {
                for kind in ["chat:typing-start", "chat:typing-stop"] {
                    let _ = hub
                        .dispatch(&sender, Envelope::new(kind, json!({"roomId": "lobby"})))
                        .await;
                }
            });
            for member in &mut members {
                member.drain();
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_send_latency, bench_typing_latency);
criterion_main!(benches);
