use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use easel_core::{CanvasObject, EditorMeta};
use easel_sync::{
    Change, ChangeEvent, ClientIdentity, EngineParts, ManualTimeSource, MemoryRowStore,
    MemoryStorage, OperationLog, QueuedOperation, SyncConfig, SyncEngine,
};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn engine_with(objects: usize) -> (SyncEngine, Vec<CanvasObject>) {
    let config = SyncConfig {
        queue_capacity: 100_000,
        ..SyncConfig::default()
    };
    let mut engine = SyncEngine::open(EngineParts {
        canvas_id: Uuid::new_v4(),
        identity: ClientIdentity::new("bench", "Bench"),
        config,
        store: Arc::new(MemoryRowStore::new()),
        storage: Arc::new(MemoryStorage::new()),
        time: Arc::new(ManualTimeSource::new(1_000)),
    });
    let scene: Vec<CanvasObject> = (0..objects)
        .map(|i| CanvasObject::rect(i as f32, 0.0, 10.0, 10.0).with_z(i as i64))
        .collect();
    engine.apply_local_change(scene);
    let scene = engine.objects();
    (engine, scene)
}

fn bench_local_drag_1k(c: &mut Criterion) {
    c.bench_function("engine_local_drag_1k_objects", |b| {
        b.iter_batched(
            || {
                let (engine, mut scene) = engine_with(1000);
                scene[500].x += 4.0;
                (engine, scene)
            },
            |(mut engine, scene)| black_box(engine.apply_local_change(scene)),
            BatchSize::SmallInput,
        )
    });
}

fn bench_remote_apply(c: &mut Criterion) {
    let (mut engine, scene) = engine_with(1000);
    let canvas_id = engine.canvas_id();
    let meta = EditorMeta::new("remote", "Remote", 2_000);
    let mut version = engine.clock_value();

    c.bench_function("engine_remote_update", |b| {
        b.iter(|| {
            version += 1;
            let obj = scene[version as usize % scene.len()]
                .clone()
                .stamped(version, meta.clone());
            let event = ChangeEvent::new(canvas_id, Uuid::nil(), Change::Updated(obj), version, &meta);
            black_box(engine.apply_remote_change(event));
        })
    });
}

fn bench_oplog_flush_coalesced(c: &mut Criterion) {
    // 20 objects, 25 moves each: 500 queued ops collapse to 20 writes.
    let canvas_id = Uuid::new_v4();
    let meta = EditorMeta::new("bench", "Bench", 1_000);
    let objects: Vec<CanvasObject> = (0..20).map(|i| CanvasObject::rect(i as f32, 0.0, 1.0, 1.0)).collect();
    let ops: Vec<QueuedOperation> = (1..=500u64)
        .map(|v| {
            let obj = objects[(v % 20) as usize].clone().stamped(v, meta.clone());
            let event = ChangeEvent::new(canvas_id, Uuid::nil(), Change::Updated(obj), v, &meta);
            QueuedOperation::from_event(&event, 1_000)
        })
        .collect();

    c.bench_function("oplog_flush_500_ops_20_objects", |b| {
        b.iter_batched(
            || {
                let (mut log, _) = OperationLog::open(Arc::new(MemoryStorage::new()), "bench", 1_000);
                for op in &ops {
                    let _ = log.enqueue(op.clone());
                }
                (log, MemoryRowStore::new())
            },
            |(mut log, store)| black_box(log.flush(canvas_id, &store)),
            BatchSize::SmallInput,
        )
    });
}

fn bench_event_codec(c: &mut Criterion) {
    let meta = EditorMeta::new("alice", "Alice", 1_000);
    let obj = CanvasObject::text(10.0, 20.0, "benchmark label").stamped(42, meta.clone());
    let event = ChangeEvent::new(Uuid::new_v4(), Uuid::new_v4(), Change::Updated(obj), 42, &meta);
    let bytes = event.encode().unwrap();

    c.bench_function("change_event_encode", |b| {
        b.iter(|| black_box(event.encode()))
    });
    c.bench_function("change_event_decode", |b| {
        b.iter(|| black_box(ChangeEvent::decode(black_box(&bytes))))
    });
}

criterion_group!(
    benches,
    bench_local_drag_1k,
    bench_remote_apply,
    bench_oplog_flush_coalesced,
    bench_event_codec
);
criterion_main!(benches);
