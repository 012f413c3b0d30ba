use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nexus_event_bridge::{
    AnswerReceiver, Event, EventState, Handling, RegistryConfig, RequestReceiver, WorkerRegistry,
};
use std::sync::Arc;

const BATCH_SIZES: &[u64] = &[1, 10, 100];

fn create_registry() -> WorkerRegistry {
    WorkerRegistry::new(RegistryConfig::new().with_domain("bench")).unwrap()
}

fn echo_receiver(registry: &WorkerRegistry) -> RequestReceiver<u64> {
    RequestReceiver::new(registry, "bench", |event: &Arc<Event<u64>>| {
        *event.payload() += 1;
    })
    .unwrap()
}

/// Caller blocks in `post` for every exchange
fn bench_sync_round_trip(c: &mut Criterion) {
    let registry = create_registry();
    let receiver = echo_receiver(&registry);
    let mut group = c.benchmark_group("sync_round_trip");

    for &batch in BATCH_SIZES {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::new("post", batch), &batch, |b, &batch| {
            b.iter(|| {
                for i in 0..batch {
                    let event = Event::with_handling(black_box(i), Handling::Sync);
                    receiver.post(&event).unwrap();
                }
            });
        });
    }
    group.finish();
}

/// Answers come back through the main loop
fn bench_async_round_trip(c: &mut Criterion) {
    let registry = create_registry();
    let receiver = echo_receiver(&registry);
    let answers = AnswerReceiver::new(&registry, |event: &Arc<Event<u64>>| {
        black_box(*event.payload());
    });
    let mut group = c.benchmark_group("async_round_trip");

    for &batch in BATCH_SIZES {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::new("post", batch), &batch, |b, &batch| {
            b.iter(|| {
                let events: Vec<_> = (0..batch)
                    .map(|i| {
                        let event = Event::with_handling(i, Handling::Async);
                        event.set_answer_receiver(&answers);
                        receiver.post(&event).unwrap();
                        event
                    })
                    .collect();
                registry
                    .main_loop()
                    .run_until(|| events.iter().all(|e| e.state() == EventState::Ended));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sync_round_trip, bench_async_round_trip);
criterion_main!(benches);
