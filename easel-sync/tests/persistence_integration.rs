//! Restart tests against a real RocksDB directory.

use std::sync::Arc;

use easel_core::{CanvasObject, EditorMeta};
use easel_sync::{
    ClientIdentity, EngineParts, ManualTimeSource, RocksStore, RowStore, StoreConfig, SyncConfig,
    SyncEngine,
};
use tempfile::TempDir;
use uuid::Uuid;

fn open_store(dir: &TempDir) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap())
}

fn open_engine(store: Arc<RocksStore>, canvas_id: Uuid, identity: &ClientIdentity) -> SyncEngine {
    SyncEngine::open(EngineParts {
        canvas_id,
        identity: identity.clone(),
        config: SyncConfig::for_testing(),
        store: store.clone(),
        storage: store,
        time: Arc::new(ManualTimeSource::new(50_000)),
    })
}

#[test]
fn test_snapshot_and_rows_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let canvas_id = Uuid::new_v4();
    let identity = ClientIdentity::new("alice", "Alice");

    let rect = CanvasObject::rect(10.0, 10.0, 40.0, 20.0).with_z(2);
    let note = CanvasObject::text(0.0, 0.0, "hello").with_z(1);
    {
        let store = open_store(&dir);
        let mut engine = open_engine(store, canvas_id, &identity);
        engine.set_connected(true);
        engine.apply_local_change(vec![rect.clone(), note.clone()]);
        assert!(engine.flush_store().is_clean());
        engine.persist_snapshot().unwrap();
    }

    let store = open_store(&dir);
    assert_eq!(store.fetch_all(canvas_id).unwrap().len(), 2);

    let engine = open_engine(store, canvas_id, &identity);
    let objects = engine.objects();
    assert_eq!(objects.len(), 2);
    assert_eq!(objects[0].id, note.id);
    assert_eq!(objects[1].id, rect.id);
    assert_eq!(objects[1].version, 1);
    assert_eq!(engine.clock_value(), 1);
    assert!(engine.queue().is_empty());
    assert!(engine.pending_replay().is_none());
    assert!(!engine.needs_full_refetch());
}

#[test]
fn test_unflushed_queue_replays_after_reopen() {
    let dir = TempDir::new().unwrap();
    let canvas_id = Uuid::new_v4();
    let identity = ClientIdentity::new("alice", "Alice");

    let obj = CanvasObject::ellipse(5.0, 5.0, 8.0, 8.0);
    {
        let store = open_store(&dir);
        let mut engine = open_engine(store, canvas_id, &identity);
        engine.apply_local_change(vec![obj.clone()]);
        let mut moved = obj.clone();
        moved.x = 77.0;
        engine.apply_local_change(vec![moved]);
        engine.persist_snapshot().unwrap();
        assert_eq!(engine.queue().len(), 2);
    }

    let store = open_store(&dir);
    assert!(store.fetch_all(canvas_id).unwrap().is_empty());

    let mut engine = open_engine(store.clone(), canvas_id, &identity);
    assert_eq!(engine.queue().len(), 2);
    assert!(engine.pending_replay().is_some());
    assert_eq!(engine.object(&obj.id).unwrap().x, 77.0);

    let report = engine.flush_store();
    assert!(report.is_clean());
    assert_eq!(report.writes, 1);

    let row = store.fetch_all(canvas_id).unwrap().remove(0);
    assert_eq!((row.x, row.version), (77.0, 2));

    engine.fetch_and_reconcile().unwrap();
    assert!(engine.pending_replay().is_none());
}

#[test]
fn test_row_store_keeps_newer_row_across_reopen() {
    let dir = TempDir::new().unwrap();
    let canvas_id = Uuid::new_v4();
    let base = CanvasObject::rect(0.0, 0.0, 1.0, 1.0);

    {
        let store = open_store(&dir);
        let newer = base.clone().stamped(4, EditorMeta::new("bob", "Bob", 400));
        store.upsert(canvas_id, &newer).unwrap();
    }

    let store = open_store(&dir);
    let older = base.clone().stamped(3, EditorMeta::new("alice", "Alice", 900));
    store.upsert(canvas_id, &older).unwrap();

    let rows = store.fetch_all(canvas_id).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].version, 4);
    assert_eq!(rows[0].last_editor.as_ref().unwrap().user_id, "bob");
}
