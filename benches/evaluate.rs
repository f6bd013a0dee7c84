use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use gatewarden::access::{AccessConfig, AccessEvaluator};
use gatewarden::clock::SystemClock;
use gatewarden::feed::ChangeEvent;
use gatewarden::hardware::{parse_frame, RecordingActuator};
use gatewarden::shutdown;
use gatewarden::storage::{CredentialStore, CredentialView, InMemoryCredentialStore};
use gatewarden::sync::{SyncConfig, SyncEngine};
use gatewarden::CredentialRecord;

const TAGS: usize = 4096;

fn tag(i: usize) -> String {
    format!("{i:012X}")
}

fn seeded_store() -> Arc<InMemoryCredentialStore> {
    let store = Arc::new(InMemoryCredentialStore::default());
    let now = Utc::now();
    for i in 0..TAGS {
        let record = CredentialRecord::new(tag(i), format!("resident-{i}"), "Main", now).with_active(i % 10 != 0);
        store.upsert(record).unwrap();
    }
    store
}

fn bench_evaluate(c: &mut Criterion) {
    let store = seeded_store();
    let evaluator = AccessEvaluator::new(
        CredentialView::new(store),
        Arc::new(RecordingActuator::new()),
        Arc::new(SystemClock),
        AccessConfig {
            key_len: Some(12),
            ..AccessConfig::default()
        },
    );

    let mut group = c.benchmark_group("access");
    group.throughput(Throughput::Elements(1));

    // Deny path: no actuation, pure cache lookup.
    group.bench_function("decide_unknown", |b| {
        let id = gatewarden::CredentialId::new("FFFFFFFFFFFF");
        b.iter(|| evaluator.decide(&id));
    });

    group.bench_function("frame_to_decision", |b| {
        let frames: Vec<String> = (0..TAGS).map(|i| format!("#{}0\r\n", tag(i))).collect();
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % frames.len();
            let id = parse_frame(&frames[i], 13).unwrap();
            evaluator.decide(&id)
        });
    });

    group.finish();
}

fn bench_sync_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync");
    group.throughput(Throughput::Elements(1));

    group.bench_function("apply_modified", |b| {
        b.iter_custom(|iters| {
            // Fresh state per sample so tombstones do not accumulate.
            let store = Arc::new(InMemoryCredentialStore::default());
            let (_trigger, signal) = shutdown::channel();
            let mut engine = SyncEngine::new(store, SyncConfig::default(), signal);
            let base = Utc::now();

            let start = Instant::now();
            for n in 0..iters {
                let at = base + chrono::Duration::milliseconds(i64::try_from(n).unwrap_or(i64::MAX));
                let record = CredentialRecord::new(tag(n as usize % TAGS), "resident", "Main", at);
                engine.apply(ChangeEvent::Modified(record)).unwrap();
            }
            start.elapsed()
        })
    });

    group.finish();
}

criterion_group!(evaluate, bench_evaluate, bench_sync_apply);
criterion_main!(evaluate);
