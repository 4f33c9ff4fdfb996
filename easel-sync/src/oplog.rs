//! Durable offline queue of local mutations.
//!
//! Every local change is appended here regardless of connectivity and
//! stays until the row store has accepted it. The whole queue is
//! rewritten to local storage (JSON) on every mutation, so a restart
//! resumes with exactly the unacknowledged work.
//!
//! ```text
//!  enqueue ──► [ op | op | op | ... ] ──► flush ──► RowStore
//!                │   (cap: oldest evicted)   │
//!                ▼                           └─ failed groups stay queued
//!           LocalStorage (JSON)
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use easel_core::{CanvasObject, EditorMeta, ObjectId, VersionStamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{Change, ChangeEvent};
use crate::storage::{LocalStorage, RowStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// A local mutation awaiting store acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub kind: OperationKind,
    pub object: Option<CanvasObject>,
    pub object_id: ObjectId,
    pub version: u64,
    pub meta: EditorMeta,
    pub enqueued_at: u64,
}

impl QueuedOperation {
    pub fn from_event(event: &ChangeEvent, enqueued_at: u64) -> Self {
        let (kind, object) = match &event.change {
            Change::Created(obj) => (OperationKind::Create, Some(obj.clone())),
            Change::Updated(obj) => (OperationKind::Update, Some(obj.clone())),
            Change::Deleted { .. } => (OperationKind::Delete, None),
        };
        Self {
            kind,
            object,
            object_id: event.object_id(),
            version: event.version,
            meta: event.meta(),
            enqueued_at,
        }
    }

    pub fn stamp(&self) -> VersionStamp {
        VersionStamp::new(self.version, self.meta.timestamp_millis, self.meta.user_id.clone())
    }

    /// Rebuild the change this operation records.
    pub fn to_change(&self) -> Change {
        match (self.kind, &self.object) {
            (OperationKind::Create, Some(obj)) => Change::Created(obj.clone()),
            (OperationKind::Update, Some(obj)) => Change::Updated(obj.clone()),
            _ => Change::Deleted {
                object_id: self.object_id,
            },
        }
    }
}

/// How a load went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Empty,
    Loaded(usize),
    /// Persisted bytes were unreadable and were treated as an empty queue.
    Corrupt,
}

/// Result of a flush pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// Queue entries acknowledged by the store.
    pub applied: usize,
    /// Store writes issued (one per object id after coalescing).
    pub writes: usize,
    /// Object ids whose writes failed and stay queued.
    pub failed: Vec<ObjectId>,
    pub remaining: usize,
    pub last_error: Option<String>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The single write a group of same-id operations collapses to.
enum CoalescedWrite<'a> {
    Upsert(&'a CanvasObject),
    Update(&'a CanvasObject),
    Delete(ObjectId, VersionStamp),
}

fn coalesce<'a>(object_id: ObjectId, ops: &[&'a QueuedOperation]) -> CoalescedWrite<'a> {
    let Some(last) = ops.last() else {
        return CoalescedWrite::Delete(object_id, VersionStamp::version_only(0));
    };
    match (last.kind, last.object.as_ref()) {
        (OperationKind::Delete, _) | (_, None) => CoalescedWrite::Delete(object_id, last.stamp()),
        (_, Some(obj)) if ops.iter().any(|op| op.kind == OperationKind::Create) => {
            CoalescedWrite::Upsert(obj)
        }
        (_, Some(obj)) => CoalescedWrite::Update(obj),
    }
}

fn apply_write(store: &dyn RowStore, canvas_id: Uuid, write: &CoalescedWrite<'_>) -> Result<(), StoreError> {
    match write {
        CoalescedWrite::Upsert(obj) => store.upsert(canvas_id, obj),
        CoalescedWrite::Update(obj) => match store.update(canvas_id, obj.id, obj) {
            // Row never made it to the store (e.g. created offline by a peer).
            Err(StoreError::NotFound(_)) => store.upsert(canvas_id, obj),
            other => other,
        },
        CoalescedWrite::Delete(id, stamp) => store.delete(canvas_id, *id, stamp),
    }
}

/// Bounded, durable, ordered queue of local mutations.
pub struct OperationLog {
    storage: Arc<dyn LocalStorage>,
    key: String,
    queue: VecDeque<QueuedOperation>,
    capacity: usize,
    evicted_total: u64,
}

impl OperationLog {
    /// Open the queue stored under `key`, treating unreadable state as empty.
    pub fn open(storage: Arc<dyn LocalStorage>, key: impl Into<String>, capacity: usize) -> (Self, LoadOutcome) {
        let mut log = Self {
            storage,
            key: key.into(),
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            evicted_total: 0,
        };
        let outcome = log.load();
        (log, outcome)
    }

    /// Replace the in-memory queue with the persisted one.
    pub fn load(&mut self) -> LoadOutcome {
        let bytes = match self.storage.get(&self.key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.queue.clear();
                return LoadOutcome::Empty;
            }
            Err(e) => {
                log::warn!("Could not read offline queue {}: {e}", self.key);
                self.queue.clear();
                return LoadOutcome::Corrupt;
            }
        };

        match serde_json::from_slice::<Vec<QueuedOperation>>(&bytes) {
            Ok(ops) => {
                let count = ops.len();
                self.queue = ops.into();
                if count == 0 {
                    LoadOutcome::Empty
                } else {
                    log::info!("Loaded {count} queued operations from {}", self.key);
                    LoadOutcome::Loaded(count)
                }
            }
            Err(e) => {
                log::warn!("Offline queue {} is corrupt, starting empty: {e}", self.key);
                self.queue.clear();
                LoadOutcome::Corrupt
            }
        }
    }

    /// Write the full queue to local storage.
    pub fn save(&self) -> Result<(), StoreError> {
        let ops: Vec<&QueuedOperation> = self.queue.iter().collect();
        let json = serde_json::to_vec(&ops).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.storage.put(&self.key, &json)
    }

    /// Append an operation, evicting the oldest entries past capacity.
    ///
    /// The in-memory append always happens; an `Err` means only the durable
    /// write failed and the next successful save will include this entry.
    pub fn enqueue(&mut self, op: QueuedOperation) -> Result<Vec<QueuedOperation>, StoreError> {
        self.queue.push_back(op);

        let mut evicted = Vec::new();
        while self.queue.len() > self.capacity {
            if let Some(old) = self.queue.pop_front() {
                evicted.push(old);
            }
        }
        if !evicted.is_empty() {
            self.evicted_total += evicted.len() as u64;
            log::warn!(
                "Offline queue full ({}): dropped {} oldest operations, {} lost in total",
                self.capacity,
                evicted.len(),
                self.evicted_total
            );
        }

        self.save()?;
        Ok(evicted)
    }

    /// Replay queued operations against the store in enqueue order.
    ///
    /// Operations are grouped per object id and each group collapses to
    /// one write carrying the last state. A failed group stays queued in
    /// its original order; groups for other ids are still attempted.
    pub fn flush(&mut self, canvas_id: Uuid, store: &dyn RowStore) -> Result<FlushReport, StoreError> {
        let mut report = FlushReport::default();
        if self.queue.is_empty() {
            return Ok(report);
        }

        let mut order: Vec<ObjectId> = Vec::new();
        let mut groups: HashMap<ObjectId, Vec<usize>> = HashMap::new();
        for (idx, op) in self.queue.iter().enumerate() {
            groups
                .entry(op.object_id)
                .or_insert_with(|| {
                    order.push(op.object_id);
                    Vec::new()
                })
                .push(idx);
        }

        let mut keep = vec![false; self.queue.len()];
        for id in &order {
            let indices = &groups[id];
            let ops: Vec<&QueuedOperation> = indices.iter().map(|&i| &self.queue[i]).collect();
            let write = coalesce(*id, &ops);
            report.writes += 1;

            match apply_write(store, canvas_id, &write) {
                Ok(()) => report.applied += indices.len(),
                Err(e) => {
                    log::debug!("Store write for {id} failed, keeping {} ops queued: {e}", indices.len());
                    for &i in indices {
                        keep[i] = true;
                    }
                    report.failed.push(*id);
                    report.last_error = Some(e.to_string());
                }
            }
        }

        let drained: Vec<QueuedOperation> = self.queue.drain(..).collect();
        self.queue = drained
            .into_iter()
            .zip(keep)
            .filter_map(|(op, kept)| kept.then_some(op))
            .collect();
        report.remaining = self.queue.len();

        if report.applied > 0 {
            self.save()?;
        }
        Ok(report)
    }

    /// Empty the queue and persist the empty state.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.queue.clear();
        self.save()
    }

    /// FNV-1a over the queued `(object_id, version, kind)` sequence.
    pub fn fingerprint(&self) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        let mut mix = |bytes: &[u8]| {
            for byte in bytes {
                hash ^= *byte as u64;
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        };
        for op in &self.queue {
            mix(op.object_id.as_bytes());
            mix(&op.version.to_le_bytes());
            mix(&[op.kind as u8]);
        }
        hash
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedOperation> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Operations evicted for capacity since this log was opened.
    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }
}
