use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde::{Deserialize, Serialize};
use serde_json::json;

use async_trait::async_trait;
use forgequeue_core::{Command, ManualClock, Payload, QueueAwareJob};
use forgequeue_infra::PushOptions;
use forgequeue_infra::QueueDriver;
use forgequeue_infra::queue::MemoryQueue;

#[derive(Debug, Serialize, Deserialize)]
struct RenderReport {
    report_id: u64,
    recipients: Vec<String>,
}

#[async_trait]
impl Command for RenderReport {
    const NAME: &'static str = "reports.render";

    async fn handle(&self, _job: &mut dyn QueueAwareJob) -> anyhow::Result<()> {
        Ok(())
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

fn bench_payload_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_encoding");
    let command = RenderReport {
        report_id: 7,
        recipients: (0..20).map(|n| format!("user{n}@example.com")).collect(),
    };

    group.bench_function("encode_command", |b| {
        b.iter(|| {
            black_box(Payload::for_command(&command).unwrap().encode().unwrap());
        });
    });

    let raw = Payload::for_command(&command).unwrap().encode().unwrap();
    group.bench_function("decode_command", |b| {
        b.iter(|| {
            black_box(Payload::decode(black_box(&raw)).unwrap());
        });
    });

    group.finish();
}

fn bench_memory_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_round_trip");
    let rt = runtime();
    let payload = Payload::raw("reports.render", json!({ "report_id": 7 }))
        .encode()
        .unwrap();

    for batch_size in [1usize, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("push_pop_delete", batch_size),
            batch_size,
            |b, &size| {
                let clock = ManualClock::starting_now();
                let queue = MemoryQueue::new("default", 90, clock.shared());

                b.iter(|| {
                    rt.block_on(async {
                        for _ in 0..size {
                            queue
                                .push_raw(payload.clone(), "default", PushOptions::default())
                                .await
                                .unwrap();
                        }
                        while let Some(job) = queue.pop("default").await.unwrap() {
                            queue.delete_reserved("default", &job).await.unwrap();
                        }
                    });
                });
            },
        );
    }

    group.finish();
}

fn bench_bulk_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_push");
    let rt = runtime();

    for batch_size in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::new("bulk_raw", batch_size), batch_size, |b, &size| {
            let payloads: Vec<String> = (0..size)
                .map(|n| Payload::raw("reports.render", json!({ "report_id": n })).encode().unwrap())
                .collect();

            b.iter(|| {
                let clock = ManualClock::starting_now();
                let queue = MemoryQueue::new("default", 90, clock.shared());
                rt.block_on(async {
                    black_box(queue.bulk_raw(payloads.clone(), "default").await.unwrap());
                });
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_payload_encoding,
    bench_memory_round_trip,
    bench_bulk_push
);
criterion_main!(benches);
