//! Offline editing, reconnect backoff and queue replay, under paused time.

use std::sync::Arc;
use std::time::Duration;

use easel_core::CanvasObject;
use easel_sync::{
    ClientIdentity, ConnectionStatus, EngineParts, LocalHub, MemoryRowStore, MemoryStorage,
    SessionHandle, SyncConfig, SyncEngine, SyncSession, SystemTimeSource,
};
use uuid::Uuid;

struct Client {
    handle: SessionHandle,
    canvas_id: Uuid,
}

fn spawn_client(hub: &LocalHub, store: Arc<MemoryRowStore>, storage: Arc<MemoryStorage>) -> Client {
    let canvas_id = Uuid::new_v4();
    let engine = SyncEngine::open(EngineParts {
        canvas_id,
        identity: ClientIdentity::new("alice", "Alice"),
        config: SyncConfig::for_testing(),
        store,
        storage,
        time: Arc::new(SystemTimeSource),
    });
    let channel = hub.channel(engine.identity().client_id);
    Client {
        handle: SyncSession::spawn(engine, Some(Box::new(channel))),
        canvas_id,
    }
}

async fn wait_status(handle: &SessionHandle, pred: impl FnMut(&ConnectionStatus) -> bool) -> ConnectionStatus {
    let mut rx = handle.subscribe_status();
    let status = *rx.wait_for(pred).await.expect("session alive");
    status
}

#[tokio::test(start_paused = true)]
async fn test_offline_edits_flush_after_reconnect() {
    let hub = LocalHub::new(64);
    let store = Arc::new(MemoryRowStore::new());
    let client = spawn_client(&hub, store.clone(), Arc::new(MemoryStorage::new()));
    let handle = &client.handle;
    wait_status(handle, |s| s.connected).await;

    // Two objects reach the store while online.
    let b = CanvasObject::rect(0.0, 0.0, 5.0, 5.0);
    let c = CanvasObject::ellipse(10.0, 10.0, 5.0, 5.0);
    handle.apply_local_change(vec![b.clone(), c.clone()]).await.unwrap();
    handle.flush_now().await.unwrap();
    assert_eq!(store.row_count(client.canvas_id), 2);

    hub.set_online(false);
    wait_status(handle, |s| !s.connected).await;

    // Offline: create a, update b, delete c.
    let a = CanvasObject::text(1.0, 1.0, "offline note");
    let mut b_moved = b.clone();
    b_moved.x = 99.0;
    let report = handle
        .apply_local_change(vec![a.clone(), b_moved.clone()])
        .await
        .unwrap();
    assert_eq!((report.created, report.updated, report.deleted), (1, 1, 1));

    // The debounce passes while offline; nothing reaches the store.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(status, ConnectionStatus { connected: false, queued: 3, degraded: false });
    assert!(store.row(client.canvas_id, a.id).is_none());

    hub.set_online(true);
    let status = wait_status(handle, |s| s.connected && s.queued == 0).await;
    assert_eq!((status.connected, status.queued), (true, 0));

    assert!(store.row(client.canvas_id, a.id).is_some());
    assert_eq!(store.row(client.canvas_id, b.id).unwrap().x, 99.0);
    assert!(store.row(client.canvas_id, c.id).is_none());
    assert_eq!(handle.objects().await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_doubles_and_resets() {
    let hub = LocalHub::new(64);
    hub.set_online(false);
    let client = spawn_client(&hub, Arc::new(MemoryRowStore::new()), Arc::new(MemoryStorage::new()));
    let handle = &client.handle;

    // Attempts at t=0, 1, 3, 7 (delays 1s, 2s, 4s).
    tokio::time::sleep(Duration::from_millis(6_900)).await;
    assert_eq!(handle.stats().await.unwrap().connect_attempts, 3);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.connect_attempts, 4);
    assert_eq!(stats.backoff_attempt, 4);

    // Next retry is 8s later, at t=15.
    hub.set_online(true);
    tokio::time::sleep(Duration::from_millis(7_800)).await;
    assert!(!handle.status().await.unwrap().connected);
    wait_status(handle, |s| s.connected).await;

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.connect_attempts, 5);
    assert_eq!(stats.backoff_attempt, 0);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_caps_at_thirty_seconds() {
    let hub = LocalHub::new(64);
    hub.set_online(false);
    let client = spawn_client(&hub, Arc::new(MemoryRowStore::new()), Arc::new(MemoryStorage::new()));

    // 1+2+4+8+16 = 31s for six attempts, then one every 30s.
    tokio::time::sleep(Duration::from_millis(31_100)).await;
    assert_eq!(client.handle.stats().await.unwrap().connect_attempts, 6);
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(client.handle.stats().await.unwrap().connect_attempts, 6);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(client.handle.stats().await.unwrap().connect_attempts, 7);
}

#[tokio::test(start_paused = true)]
async fn test_restart_replays_persisted_queue() {
    let hub = LocalHub::new(64);
    hub.set_online(false);
    let store = Arc::new(MemoryRowStore::new());
    let storage = Arc::new(MemoryStorage::new());
    let canvas_id = Uuid::new_v4();
    let identity = ClientIdentity::new("alice", "Alice");

    let open = |store: Arc<MemoryRowStore>, storage: Arc<MemoryStorage>| {
        SyncEngine::open(EngineParts {
            canvas_id,
            identity: identity.clone(),
            config: SyncConfig::for_testing(),
            store,
            storage,
            time: Arc::new(SystemTimeSource),
        })
    };

    let obj = CanvasObject::rect(3.0, 3.0, 3.0, 3.0);
    {
        let engine = open(store.clone(), storage.clone());
        let channel = hub.channel(identity.client_id);
        let handle = SyncSession::spawn(engine, Some(Box::new(channel)));
        handle.apply_local_change(vec![obj.clone()]).await.unwrap();
        handle.shutdown().await.unwrap();
    }
    assert_eq!(store.row_count(canvas_id), 0);

    hub.set_online(true);
    let engine = open(store.clone(), storage.clone());
    assert_eq!(engine.status().queued, 1);
    assert!(engine.pending_replay().is_some());

    let channel = hub.channel(identity.client_id);
    let handle = SyncSession::spawn(engine, Some(Box::new(channel)));
    wait_status(&handle, |s| s.connected && s.queued == 0).await;
    assert_eq!(store.row(canvas_id, obj.id).unwrap().version, 1);
    assert_eq!(handle.objects().await.unwrap().len(), 1);
}
