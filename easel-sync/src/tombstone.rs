//! Deletion markers that reject stale re-creates.
//!
//! A tombstone lives until a create with a winning stamp replaces it or
//! until `retention` has elapsed since the delete. Past that window a stale
//! message for the id is accepted again; the window is a chosen trade-off,
//! not a guarantee.

use std::collections::HashMap;
use std::time::Duration;

use easel_core::{EditorMeta, ObjectId, VersionStamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub object_id: ObjectId,
    pub version: u64,
    pub timestamp_millis: u64,
    pub user_id: String,
    /// Local wall-clock time the tombstone was written; drives expiry.
    pub deleted_at_millis: u64,
}

impl Tombstone {
    pub fn new(object_id: ObjectId, version: u64, meta: &EditorMeta, deleted_at_millis: u64) -> Self {
        Self {
            object_id,
            version,
            timestamp_millis: meta.timestamp_millis,
            user_id: meta.user_id.clone(),
            deleted_at_millis,
        }
    }

    pub fn stamp(&self) -> VersionStamp {
        VersionStamp::new(self.version, self.timestamp_millis, self.user_id.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TombstoneSet {
    entries: HashMap<ObjectId, Tombstone>,
}

impl TombstoneSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = Tombstone>) -> Self {
        Self {
            entries: entries.into_iter().map(|t| (t.object_id, t)).collect(),
        }
    }

    pub fn record(&mut self, tombstone: Tombstone) {
        self.entries.insert(tombstone.object_id, tombstone);
    }

    pub fn get(&self, id: &ObjectId) -> Option<&Tombstone> {
        self.entries.get(id)
    }

    pub fn remove(&mut self, id: &ObjectId) -> Option<Tombstone> {
        self.entries.remove(id)
    }

    /// Drop tombstones older than `retention`. Returns how many were dropped.
    pub fn collect_expired(&mut self, now_millis: u64, retention: Duration) -> usize {
        let retention_ms = retention.as_millis() as u64;
        let before = self.entries.len();
        self.entries
            .retain(|_, t| now_millis.saturating_sub(t.deleted_at_millis) < retention_ms);
        before - self.entries.len()
    }

    /// Highest version among tombstones, for clock recovery.
    pub fn max_version(&self) -> u64 {
        self.entries.values().map(|t| t.version).max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by object id, for stable persistence.
    pub fn to_vec(&self) -> Vec<Tombstone> {
        let mut all: Vec<Tombstone> = self.entries.values().cloned().collect();
        all.sort_by_key(|t| t.object_id);
        all
    }
}
