//! In-memory backends with failure injection, for tests and embedding.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use easel_core::{CanvasObject, ObjectId, VersionStamp};
use uuid::Uuid;

use super::{row_delete_wins, row_write_wins, LocalStorage, RowStore, StoreError};

/// A write that reached the in-memory row store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    Upsert { id: ObjectId, version: u64 },
    Update { id: ObjectId, version: u64 },
    Delete { id: ObjectId, version: u64 },
}

#[derive(Default)]
struct RowState {
    rows: HashMap<Uuid, BTreeMap<ObjectId, CanvasObject>>,
    writes: Vec<StoreWrite>,
    fail_next: usize,
    unavailable: bool,
}

/// Row store kept in a mutex-guarded map.
#[derive(Default)]
pub struct MemoryRowStore {
    state: Mutex<RowState>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Toggle a persistent outage.
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Every successful write, in order.
    pub fn writes(&self) -> Vec<StoreWrite> {
        self.lock().writes.clone()
    }

    pub fn row(&self, canvas_id: Uuid, id: ObjectId) -> Option<CanvasObject> {
        self.lock().rows.get(&canvas_id).and_then(|rows| rows.get(&id).cloned())
    }

    pub fn row_count(&self, canvas_id: Uuid) -> usize {
        self.lock().rows.get(&canvas_id).map_or(0, |rows| rows.len())
    }

    /// Seed a row directly, bypassing the write log and version checks.
    pub fn seed(&self, canvas_id: Uuid, object: CanvasObject) {
        self.lock()
            .rows
            .entry(canvas_id)
            .or_default()
            .insert(object.id, object);
    }

    fn lock(&self) -> MutexGuard<'_, RowState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(state: &mut RowState) -> Result<(), StoreError> {
        if state.unavailable {
            return Err(StoreError::Unavailable("row store offline".into()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

impl RowStore for MemoryRowStore {
    fn fetch_all(&self, canvas_id: Uuid) -> Result<Vec<CanvasObject>, StoreError> {
        let mut state = self.lock();
        Self::check(&mut state)?;
        Ok(state
            .rows
            .get(&canvas_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn upsert(&self, canvas_id: Uuid, object: &CanvasObject) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::check(&mut state)?;
        let rows = state.rows.entry(canvas_id).or_default();
        if row_write_wins(rows.get(&object.id), object) {
            rows.insert(object.id, object.clone());
        }
        state.writes.push(StoreWrite::Upsert {
            id: object.id,
            version: object.version,
        });
        Ok(())
    }

    fn update(&self, canvas_id: Uuid, id: ObjectId, fields: &CanvasObject) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::check(&mut state)?;
        let rows = state.rows.entry(canvas_id).or_default();
        let existing = rows.get(&id).ok_or(StoreError::NotFound(id))?;
        if row_write_wins(Some(existing), fields) {
            let mut row = fields.clone();
            row.id = id;
            rows.insert(id, row);
        }
        state.writes.push(StoreWrite::Update {
            id,
            version: fields.version,
        });
        Ok(())
    }

    fn delete(&self, canvas_id: Uuid, id: ObjectId, stamp: &VersionStamp) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::check(&mut state)?;
        if let Some(rows) = state.rows.get_mut(&canvas_id) {
            if row_delete_wins(rows.get(&id), stamp) {
                rows.remove(&id);
            }
        }
        state.writes.push(StoreWrite::Delete {
            id,
            version: stamp.version,
        });
        Ok(())
    }
}

#[derive(Default)]
struct KvState {
    values: HashMap<String, Vec<u8>>,
    fail_writes: bool,
}

/// Key-value local storage kept in memory.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<KvState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `put`/`remove` fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().values.contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, KvState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LocalStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().values.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(StoreError::Unavailable("local storage read-only".into()));
        }
        state.values.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(StoreError::Unavailable("local storage read-only".into()));
        }
        state.values.remove(key);
        Ok(())
    }
}
