//! The sync engine: authoritative object map for one canvas/client pair.
//!
//! ```text
//!  apply_local_change(next)                 apply_remote_change(event)
//!        │                                          │
//!        ▼                                          ▼
//!   diff + stamp (clock) ──► objects ◄── resolver gate + observe(version)
//!        │                     │
//!        ├─► broadcast         ├─► watch: object set / status
//!        └─► OperationLog      └─► Snapshot (when persisted)
//!                 │
//!                 └─► flush_store ──► RowStore
//! ```
//!
//! The engine is synchronous and single-owner. [`crate::session`] wraps it
//! in a task that adds timers, debouncing and the channel lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use easel_core::{
    diff_objects, ApplyReason, CanvasObject, ConflictResolver, EditorMeta, LogicalClock, ObjectId,
    Resolution, StaleReason, VersionStamp,
};
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::oplog::{FlushReport, LoadOutcome, OperationLog, QueuedOperation};
use crate::protocol::{Change, ChangeEvent};
use crate::snapshot::{Snapshot, SnapshotLoad, SnapshotStore};
use crate::storage::{LocalStorage, RowStore, StorageKeys, StoreError};
use crate::time::TimeSource;
use crate::tombstone::{Tombstone, TombstoneSet};
use crate::transport::BroadcastChannel;

/// Who this engine edits as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Per tab/process; keys local storage and identifies echoes.
    pub client_id: Uuid,
    pub user_id: String,
    pub user_name: String,
}

impl ClientIdentity {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }

    pub fn with_client_id(mut self, client_id: Uuid) -> Self {
        self.client_id = client_id;
        self
    }
}

/// UI-facing connection summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub connected: bool,
    /// Operations not yet acknowledged by the row store.
    pub queued: usize,
    /// Set after repeated store flush failures; cleared by the next clean flush.
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalChangeReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Queue entries evicted to make room; those edits will never reach the store.
    pub evicted: usize,
}

impl LocalChangeReport {
    pub fn is_empty(&self) -> bool {
        self.created + self.updated + self.deleted == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied(ApplyReason),
    Stale(StaleReason),
    /// Wrong canvas or malformed; never compared.
    Ignored,
}

impl RemoteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RemoteOutcome::Applied(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    pub applied: usize,
    pub stale: usize,
    pub replayed: usize,
}

/// Counters for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub local_changes: u64,
    pub remote_applied: u64,
    pub stale_dropped: u64,
    pub ignored: u64,
    pub broadcasts_sent: u64,
    pub broadcast_failures: u64,
    pub evicted: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub tombstones_collected: u64,
}

/// Everything an engine needs injected.
pub struct EngineParts {
    pub canvas_id: Uuid,
    pub identity: ClientIdentity,
    pub config: SyncConfig,
    pub store: Arc<dyn RowStore>,
    pub storage: Arc<dyn LocalStorage>,
    pub time: Arc<dyn TimeSource>,
}

pub struct SyncEngine {
    canvas_id: Uuid,
    identity: ClientIdentity,
    config: SyncConfig,
    keys: StorageKeys,

    objects: HashMap<ObjectId, CanvasObject>,
    tombstones: TombstoneSet,
    clock: LogicalClock,
    oplog: OperationLog,
    snapshots: SnapshotStore,

    store: Arc<dyn RowStore>,
    storage: Arc<dyn LocalStorage>,
    time: Arc<dyn TimeSource>,
    channel: Option<Box<dyn BroadcastChannel>>,

    connected: bool,
    degraded: bool,
    consecutive_failures: u32,
    needs_full_refetch: bool,
    snapshot_dirty: bool,
    stats: EngineStats,

    objects_tx: watch::Sender<Vec<CanvasObject>>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl SyncEngine {
    /// Restore from local storage and replay whatever was still queued.
    ///
    /// Unreadable state is treated as empty and flags the engine for a
    /// full refetch on the next reconcile; opening never fails.
    pub fn open(parts: EngineParts) -> Self {
        let EngineParts {
            canvas_id,
            identity,
            config,
            store,
            storage,
            time,
        } = parts;
        let keys = StorageKeys::new(canvas_id, identity.client_id);
        let snapshots = SnapshotStore::new(storage.clone(), keys.snapshot.clone());
        let (oplog, queue_load) = OperationLog::open(storage.clone(), keys.queue.clone(), config.queue_capacity);

        let mut needs_full_refetch = queue_load == LoadOutcome::Corrupt;
        let mut objects = HashMap::new();
        let mut tombstones = TombstoneSet::new();
        let mut clock = LogicalClock::new();

        match snapshots.load() {
            SnapshotLoad::Loaded(snapshot) => {
                clock.observe(snapshot.max_version());
                objects = snapshot
                    .restored_objects()
                    .into_iter()
                    .map(|o| (o.id, o))
                    .collect();
                tombstones = TombstoneSet::from_entries(snapshot.tombstones);
                log::info!(
                    "Restored {} objects and {} tombstones for canvas {canvas_id}",
                    objects.len(),
                    tombstones.len()
                );
            }
            SnapshotLoad::Corrupt => needs_full_refetch = true,
            SnapshotLoad::Missing => {}
        }

        let (objects_tx, _) = watch::channel(Vec::new());
        let (status_tx, _) = watch::channel(ConnectionStatus::default());

        let mut engine = Self {
            canvas_id,
            identity,
            config,
            keys,
            objects,
            tombstones,
            clock,
            oplog,
            snapshots,
            store,
            storage,
            time,
            channel: None,
            connected: false,
            degraded: false,
            consecutive_failures: 0,
            needs_full_refetch,
            snapshot_dirty: false,
            stats: EngineStats::default(),
            objects_tx,
            status_tx,
        };

        let replayed = engine.replay_queue();
        if replayed > 0 {
            log::info!("Replayed {replayed} queued operations on open");
        }
        if !engine.oplog.is_empty() {
            engine.mark_pending_replay();
        }
        if engine.needs_full_refetch {
            log::warn!("Local state for canvas {canvas_id} was unreadable; full refetch required");
        }

        engine.publish_objects();
        engine
    }

    /// Attach the broadcast channel used for outbound changes.
    pub fn attach_channel(&mut self, channel: Box<dyn BroadcastChannel>) {
        self.channel = Some(channel);
    }

    pub fn channel_mut(&mut self) -> Option<&mut (dyn BroadcastChannel + 'static)> {
        self.channel.as_deref_mut()
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    /// Apply a proposed full object set from the UI.
    pub fn apply_local_change(&mut self, next: Vec<CanvasObject>) -> LocalChangeReport {
        let diff = diff_objects(&self.objects, next);
        let mut report = LocalChangeReport::default();
        if diff.is_empty() {
            return report;
        }

        let now = self.time.now_millis();
        let meta = EditorMeta::new(self.identity.user_id.clone(), self.identity.user_name.clone(), now);
        let mut events = Vec::with_capacity(diff.len());

        for obj in diff.created {
            let version = self.next_version(now);
            let obj = obj.stamped(version, meta.clone());
            if self.tombstones.remove(&obj.id).is_some() {
                log::debug!("Re-created tombstoned object {} at v{version}", obj.id);
            }
            self.objects.insert(obj.id, obj.clone());
            events.push(self.local_event(Change::Created(obj), version, &meta));
            report.created += 1;
        }

        for obj in diff.updated {
            let version = self.next_version(now);
            let obj = obj.stamped(version, meta.clone());
            self.objects.insert(obj.id, obj.clone());
            events.push(self.local_event(Change::Updated(obj), version, &meta));
            report.updated += 1;
        }

        for id in diff.deleted {
            let version = self.next_version(now);
            self.objects.remove(&id);
            self.tombstones.record(Tombstone::new(id, version, &meta, now));
            events.push(self.local_event(Change::Deleted { object_id: id }, version, &meta));
            report.deleted += 1;
        }

        for event in &events {
            self.broadcast(event);
            match self.oplog.enqueue(QueuedOperation::from_event(event, now)) {
                Ok(evicted) => report.evicted += evicted.len(),
                Err(e) => log::warn!("Queued {} in memory only, persist failed: {e}", event.object_id()),
            }
        }

        self.stats.local_changes += events.len() as u64;
        self.stats.evicted += report.evicted as u64;
        self.snapshot_dirty = true;
        self.publish_objects();
        log::trace!(
            "Local change: {} created, {} updated, {} deleted",
            report.created,
            report.updated,
            report.deleted
        );
        report
    }

    /// Merge a change from another client, gated by the resolver.
    pub fn apply_remote_change(&mut self, event: ChangeEvent) -> RemoteOutcome {
        if event.canvas_id != self.canvas_id {
            self.stats.ignored += 1;
            return RemoteOutcome::Ignored;
        }
        if let Err(e) = event.validate() {
            log::warn!("Ignoring invalid remote event: {e}");
            self.stats.ignored += 1;
            return RemoteOutcome::Ignored;
        }
        if event.origin == self.identity.client_id {
            self.stats.stale_dropped += 1;
            return RemoteOutcome::Stale(StaleReason::Duplicate);
        }

        let stamp = event.stamp();
        let meta = event.meta();
        let kind = event.change.kind_name();
        let id = event.object_id();
        match self.merge(stamp, &meta, event.change) {
            Resolution::Apply(reason) => {
                self.stats.remote_applied += 1;
                self.publish_objects();
                RemoteOutcome::Applied(reason)
            }
            Resolution::Stale(reason) => {
                log::debug!("Dropped stale {kind} for {id} v{} ({reason:?})", event.version);
                self.stats.stale_dropped += 1;
                RemoteOutcome::Stale(reason)
            }
        }
    }

    /// Merge rows read from the store, then replay the local queue on top.
    pub fn reconcile(&mut self, rows: Vec<CanvasObject>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for row in rows {
            if row.id.is_nil() {
                continue;
            }
            let stamp = row.stamp();
            let meta = row.last_editor.clone().unwrap_or_default();
            match self.merge(stamp, &meta, Change::Updated(row)) {
                Resolution::Apply(_) => report.applied += 1,
                Resolution::Stale(_) => report.stale += 1,
            }
        }
        report.replayed = self.replay_queue();

        if let Err(e) = self.storage.remove(&self.keys.pending_replay) {
            log::warn!("Could not clear pending-replay marker: {e}");
        }
        self.needs_full_refetch = false;
        self.publish_objects();
        log::info!(
            "Reconciled canvas {}: {} rows applied, {} stale, {} replayed",
            self.canvas_id,
            report.applied,
            report.stale,
            report.replayed
        );
        report
    }

    /// Read every row from the store and reconcile against it.
    pub fn fetch_and_reconcile(&mut self) -> Result<ReconcileReport, StoreError> {
        let rows = self.store.fetch_all(self.canvas_id)?;
        Ok(self.reconcile(rows))
    }

    /// Push queued operations to the row store.
    pub fn flush_store(&mut self) -> FlushReport {
        let report = match self.oplog.flush(self.canvas_id, self.store.as_ref()) {
            Ok(report) => report,
            Err(e) => FlushReport {
                remaining: self.oplog.len(),
                last_error: Some(e.to_string()),
                ..FlushReport::default()
            },
        };
        self.stats.flushes += 1;

        if report.is_clean() && report.last_error.is_none() {
            if self.degraded {
                log::info!("Row store recovered; {} operations queued", self.oplog.len());
            }
            self.consecutive_failures = 0;
            self.degraded = false;
        } else {
            self.stats.flush_failures += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if !self.degraded && self.consecutive_failures >= self.config.degraded_after_failures {
                self.degraded = true;
                log::warn!(
                    "Row store failing ({} consecutive flushes, last: {}); running degraded",
                    self.consecutive_failures,
                    report.last_error.as_deref().unwrap_or("unknown")
                );
            }
        }

        self.publish_status();
        report
    }

    /// Write the current state as a snapshot, replacing the previous one.
    pub fn persist_snapshot(&mut self) -> Result<(), StoreError> {
        let snapshot = Snapshot::capture(
            self.objects(),
            self.tombstones.to_vec(),
            self.clock.current(),
            self.time.now_millis(),
        );
        self.snapshots.save(&snapshot)?;
        self.snapshot_dirty = false;
        Ok(())
    }

    /// Drop tombstones past their retention window.
    pub fn collect_tombstones(&mut self) -> usize {
        let dropped = self
            .tombstones
            .collect_expired(self.time.now_millis(), self.config.tombstone_retention);
        if dropped > 0 {
            log::debug!("Collected {dropped} expired tombstones");
            self.stats.tombstones_collected += dropped as u64;
            self.snapshot_dirty = true;
        }
        dropped
    }

    pub fn set_connected(&mut self, connected: bool) {
        if self.connected != connected {
            log::info!(
                "Canvas {} is now {}",
                self.canvas_id,
                if connected { "connected" } else { "offline" }
            );
        }
        self.connected = connected;
        self.publish_status();
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.connected,
            queued: self.oplog.len(),
            degraded: self.degraded,
        }
    }

    /// Live objects ordered by `z`, then id.
    pub fn objects(&self) -> Vec<CanvasObject> {
        let mut all: Vec<CanvasObject> = self.objects.values().cloned().collect();
        all.sort_by(|a, b| a.z.cmp(&b.z).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn object(&self, id: &ObjectId) -> Option<&CanvasObject> {
        self.objects.get(id)
    }

    pub fn tombstone(&self, id: &ObjectId) -> Option<&Tombstone> {
        self.tombstones.get(id)
    }

    pub fn subscribe_objects(&self) -> watch::Receiver<Vec<CanvasObject>> {
        self.objects_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.clone()
    }

    pub fn canvas_id(&self) -> Uuid {
        self.canvas_id
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn clock_value(&self) -> u64 {
        self.clock.current()
    }

    pub fn queue(&self) -> &OperationLog {
        &self.oplog
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_snapshot_dirty(&self) -> bool {
        self.snapshot_dirty
    }

    pub fn needs_full_refetch(&self) -> bool {
        self.needs_full_refetch
    }

    /// Fingerprint recorded by the last open with a non-empty queue, if any.
    pub fn pending_replay(&self) -> Option<u64> {
        match self.storage.get(&self.keys.pending_replay) {
            Ok(Some(bytes)) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| u64::from_str_radix(s, 16).ok()),
            _ => None,
        }
    }

    fn next_version(&mut self, now: u64) -> u64 {
        if self.clock.current() == 0 && self.config.bootstrap_from_wall_clock {
            self.clock.tick_from_timestamp(now)
        } else {
            self.clock.tick()
        }
    }

    fn local_event(&self, change: Change, version: u64, meta: &EditorMeta) -> ChangeEvent {
        ChangeEvent::new(self.canvas_id, self.identity.client_id, change, version, meta)
    }

    fn current_stamp(&self, id: &ObjectId) -> Option<VersionStamp> {
        self.objects
            .get(id)
            .map(CanvasObject::stamp)
            .or_else(|| self.tombstones.get(id).map(Tombstone::stamp))
    }

    /// Resolver-gated state transition shared by remote events, store rows
    /// and queue replay. Does not publish.
    fn merge(&mut self, stamp: VersionStamp, meta: &EditorMeta, change: Change) -> Resolution {
        let id = change.object_id();
        let resolution = ConflictResolver::decide(self.current_stamp(&id).as_ref(), &stamp);
        if !resolution.is_apply() {
            return resolution;
        }

        self.clock.observe(stamp.version);
        match change {
            Change::Created(obj) | Change::Updated(obj) => {
                self.tombstones.remove(&id);
                let obj = obj.stamped(stamp.version, meta.clone());
                self.objects.insert(id, obj);
            }
            Change::Deleted { object_id } => {
                self.objects.remove(&object_id);
                let now = self.time.now_millis();
                self.tombstones
                    .record(Tombstone::new(object_id, stamp.version, meta, now));
            }
        }
        self.snapshot_dirty = true;
        resolution
    }

    /// Re-apply queued local operations through the resolver.
    fn replay_queue(&mut self) -> usize {
        let ops: Vec<QueuedOperation> = self.oplog.iter().cloned().collect();
        let mut applied = 0;
        for op in ops {
            self.clock.observe(op.version);
            if self.merge(op.stamp(), &op.meta, op.to_change()).is_apply() {
                applied += 1;
            }
        }
        applied
    }

    fn mark_pending_replay(&self) {
        let marker = format!("{:016x}", self.oplog.fingerprint());
        if let Err(e) = self.storage.put(&self.keys.pending_replay, marker.as_bytes()) {
            log::warn!("Could not write pending-replay marker: {e}");
        }
    }

    fn broadcast(&mut self, event: &ChangeEvent) {
        if !self.connected {
            return;
        }
        let Some(channel) = self.channel.as_ref() else {
            return;
        };
        if !channel.is_connected() {
            return;
        }
        match channel.send(event) {
            Ok(()) => self.stats.broadcasts_sent += 1,
            Err(e) => {
                self.stats.broadcast_failures += 1;
                log::debug!("Broadcast of {} failed: {e}", event.object_id());
            }
        }
    }

    fn publish_objects(&self) {
        self.objects_tx.send_replace(self.objects());
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status());
    }
}
