use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use devconfirm::control::memory::SimulatedHome;
use devconfirm::{Action, ConfirmEngine, CorrelationId, EngineConfig, EntityId, EntityState, Intent};

const LIGHTS: usize = 64;

fn make_engine(auto_apply: bool) -> (ConfirmEngine, SimulatedHome, Vec<EntityId>) {
    let ids: Vec<EntityId> = (0..LIGHTS)
        .map(|i| EntityId::parse(&format!("light.bench_{i}")).unwrap())
        .collect();
    let home = ids
        .iter()
        .fold(SimulatedHome::new(), |home, id| home.with_entity(id, EntityState::new("off")));
    home.set_auto_apply(auto_apply);

    let engine = ConfirmEngine::start(Arc::new(home.clone()), Arc::new(home.clone()), EngineConfig::default()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !engine.health().is_live() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    (engine, home, ids)
}

/// Status reads while every operation is still pending.
fn bench_status_pending(c: &mut Criterion) {
    let (engine, _home, ids) = make_engine(false);
    let ops: Vec<CorrelationId> = ids
        .iter()
        .map(|id| {
            engine
                .dispatch_and_wait(&Intent::single(id.clone(), Action::On), Some(Duration::from_secs(60)), false)
                .unwrap()
                .correlation_id
        })
        .collect();

    let mut group = c.benchmark_group("status_polling");
    group.throughput(Throughput::Elements(ops.len() as u64));
    group.bench_function("get_operation_status/pending", |b| {
        b.iter(|| {
            for op in &ops {
                std::hint::black_box(engine.get_operation_status(*op).unwrap());
            }
        });
    });
    group.bench_function("get_bulk_status/pending", |b| {
        b.iter(|| std::hint::black_box(engine.get_bulk_status(&ops)));
    });
    group.finish();

    engine.shutdown(Duration::ZERO).unwrap();
}

/// Full dispatch-to-confirmation round trip for one bulk intent.
fn bench_bulk_round_trip(c: &mut Criterion) {
    c.bench_function("status_polling/bulk_round_trip", |b| {
        b.iter_custom(|iters| {
            let (engine, home, ids) = make_engine(true);
            let start = Instant::now();
            for i in 0..iters {
                let action = if i % 2 == 0 { Action::On } else { Action::Off };
                let result = engine
                    .dispatch_and_wait(&Intent::bulk(ids.iter().cloned(), &action), None, true)
                    .unwrap();
                std::hint::black_box(result);
            }
            let elapsed = start.elapsed();
            drop(home);
            elapsed
        });
    });
}

criterion_group!(status_polling, bench_status_pending, bench_bulk_round_trip);
criterion_main!(status_polling);
