//! Durable cache of the last known-good object set.
//!
//! A snapshot is written wholesale as JSON under one key and never patched.
//! It carries the tombstones and the clock so that a restart keeps
//! rejecting stale re-creates and never reissues a version.

use std::collections::BTreeMap;
use std::sync::Arc;

use easel_core::{CanvasObject, EditorMeta, ObjectId};
use serde::{Deserialize, Serialize};

use crate::storage::{LocalStorage, StoreError};
use crate::tombstone::Tombstone;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub objects: Vec<CanvasObject>,
    pub versions: BTreeMap<ObjectId, u64>,
    pub editors: BTreeMap<ObjectId, EditorMeta>,
    #[serde(default)]
    pub tombstones: Vec<Tombstone>,
    #[serde(default)]
    pub clock: u64,
    pub saved_at: u64,
}

impl Snapshot {
    /// Build a snapshot from live objects; version and editor maps are derived.
    pub fn capture(objects: Vec<CanvasObject>, tombstones: Vec<Tombstone>, clock: u64, saved_at: u64) -> Self {
        let versions = objects.iter().map(|o| (o.id, o.version)).collect();
        let editors = objects
            .iter()
            .filter_map(|o| o.last_editor.clone().map(|m| (o.id, m)))
            .collect();
        Self {
            objects,
            versions,
            editors,
            tombstones,
            clock,
            saved_at,
        }
    }

    /// Objects with their sync metadata restored from the side maps.
    ///
    /// The maps win over the embedded fields, since older snapshots stored
    /// only the maps.
    pub fn restored_objects(&self) -> Vec<CanvasObject> {
        self.objects
            .iter()
            .cloned()
            .map(|mut obj| {
                if let Some(v) = self.versions.get(&obj.id) {
                    obj.version = *v;
                }
                if let Some(meta) = self.editors.get(&obj.id) {
                    obj.last_editor = Some(meta.clone());
                }
                obj
            })
            .collect()
    }

    /// Highest version recorded anywhere in the snapshot.
    pub fn max_version(&self) -> u64 {
        let objects = self.versions.values().copied().max().unwrap_or(0);
        let tombstones = self.tombstones.iter().map(|t| t.version).max().unwrap_or(0);
        self.clock.max(objects).max(tombstones)
    }
}

/// Outcome of reading the persisted snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotLoad {
    Missing,
    Loaded(Snapshot),
    /// Bytes were present but unreadable.
    Corrupt,
}

pub struct SnapshotStore {
    storage: Arc<dyn LocalStorage>,
    key: String,
}

impl SnapshotStore {
    pub fn new(storage: Arc<dyn LocalStorage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
        }
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let json = serde_json::to_vec(snapshot).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.storage.put(&self.key, &json)?;
        log::trace!("Saved snapshot {} ({} objects)", self.key, snapshot.objects.len());
        Ok(())
    }

    pub fn load(&self) -> SnapshotLoad {
        let bytes = match self.storage.get(&self.key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return SnapshotLoad::Missing,
            Err(e) => {
                log::warn!("Could not read snapshot {}: {e}", self.key);
                return SnapshotLoad::Corrupt;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => SnapshotLoad::Loaded(snapshot),
            Err(e) => {
                log::warn!("Snapshot {} is corrupt, ignoring it: {e}", self.key);
                SnapshotLoad::Corrupt
            }
        }
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.storage.remove(&self.key)
    }
}
