use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{TimeZone, Utc};
use taskforge_core::{BackoffPolicy, CronPattern, JobOptions, JobPayload, PrincipalId, compute_delay};
use taskforge_infra::broker::{EnqueueRequest, InMemoryBroker, MessageBroker};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_cron_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("cron_next_run");
    let now = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();

    for pattern in ["* * * * *", "*/15 9-17 * * 1-5", "0 0 29 2 *", "30 4 1,15 * 5"] {
        let parsed = CronPattern::parse(pattern).unwrap();
        group.bench_with_input(BenchmarkId::new("next_after", pattern), &parsed, |b, parsed| {
            b.iter(|| black_box(parsed.next_after(black_box(now))));
        });
    }
    group.bench_function("parse", |b| {
        b.iter(|| CronPattern::parse(black_box("*/5 0-6,18-23 1-7 */2 0,6")).unwrap());
    });
    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let policy = BackoffPolicy::default();
    c.bench_function("backoff_compute_delay", |b| {
        b.iter(|| compute_delay(black_box(7), black_box(&policy)));
    });
}

fn bench_enqueue_pull(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("in_memory_broker");

    for batch_size in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::new("enqueue_then_drain", batch_size), &batch_size, |b, &n| {
            let options = JobOptions::for_principal(PrincipalId::new());
            b.iter(|| {
                rt.block_on(async {
                    let broker = InMemoryBroker::new();
                    for i in 0..n {
                        let opts = options.clone().with_priority((i % 5) as i32);
                        broker
                            .enqueue(EnqueueRequest::new("bench", "job", JobPayload::new(), opts))
                            .await
                            .unwrap();
                    }
                    while let Some(job) = broker.pull_next("bench").await.unwrap() {
                        broker.complete("bench", &job.id, serde_json::Value::Null).await.unwrap();
                    }
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cron_planning, bench_backoff, bench_enqueue_pull);
criterion_main!(benches);
