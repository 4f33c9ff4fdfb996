//! Durability layer: the shared row store and per-client local storage.
//!
//! ```text
//! ┌─────────────┐  flush (debounced)  ┌──────────────┐
//! │ SyncEngine  │ ──────────────────► │ RowStore     │  shared, eventually
//! │             │ ◄────────────────── │ (rows)       │  consistent
//! └──────┬──────┘   fetch_all         └──────────────┘
//!        │
//!        │ queue + snapshot (every mutation / debounced)
//!        ▼
//! ┌──────────────┐
//! │ LocalStorage │  private to one canvas/client pair
//! │ (key-value)  │
//! └──────────────┘
//! ```
//!
//! Both traits are synchronous: calls come from the session task, and
//! the backends here are in-memory or embedded.

pub mod memory;
pub mod rocks;

use easel_core::{CanvasObject, ConflictResolver, ObjectId, VersionStamp};
use uuid::Uuid;

pub use memory::{MemoryRowStore, MemoryStorage, StoreWrite};
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Object not found: {0}")]
    NotFound(ObjectId),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

/// Shared row store holding the durable copy of every canvas.
///
/// The engine treats it purely as durability, never as live truth.
pub trait RowStore: Send + Sync {
    fn fetch_all(&self, canvas_id: Uuid) -> Result<Vec<CanvasObject>, StoreError>;

    fn upsert(&self, canvas_id: Uuid, object: &CanvasObject) -> Result<(), StoreError>;

    /// Replace an existing row. Fails with [`StoreError::NotFound`] if absent.
    fn update(&self, canvas_id: Uuid, id: ObjectId, fields: &CanvasObject) -> Result<(), StoreError>;

    /// Remove a row unless it carries a stamp that beats `stamp`.
    fn delete(&self, canvas_id: Uuid, id: ObjectId, stamp: &VersionStamp) -> Result<(), StoreError>;
}

/// Key-value storage private to one client.
pub trait LocalStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Whether a row write should replace what the store already holds.
///
/// A late flush of a write that lost to a peer must not clobber the winner.
/// Re-writing an identical stamp is allowed so retries stay idempotent.
pub(crate) fn row_write_wins(existing: Option<&CanvasObject>, incoming: &CanvasObject) -> bool {
    match existing {
        None => true,
        Some(current) => {
            let (cur, inc) = (current.stamp(), incoming.stamp());
            cur == inc || ConflictResolver::should_apply(Some(&cur), &inc)
        }
    }
}

/// Whether a delete stamped `stamp` may remove the stored row.
///
/// A delete that lost to a newer write leaves the winner in place.
pub(crate) fn row_delete_wins(existing: Option<&CanvasObject>, stamp: &VersionStamp) -> bool {
    match existing {
        None => true,
        Some(current) => ConflictResolver::should_apply(Some(&current.stamp()), stamp),
    }
}

/// Storage keys for one canvas/client pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub queue: String,
    pub snapshot: String,
    pub pending_replay: String,
}

impl StorageKeys {
    pub fn new(canvas_id: Uuid, client_id: Uuid) -> Self {
        let prefix = format!("easel:{canvas_id}:{client_id}");
        Self {
            queue: format!("{prefix}:queue"),
            snapshot: format!("{prefix}:snapshot"),
            pending_replay: format!("{prefix}:pending-replay"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_core::EditorMeta;

    #[test]
    fn test_storage_keys_are_scoped() {
        let canvas = Uuid::new_v4();
        let a = StorageKeys::new(canvas, Uuid::new_v4());
        let b = StorageKeys::new(canvas, Uuid::new_v4());
        assert_ne!(a.queue, b.queue);
        assert!(a.queue.ends_with(":queue"));
        assert!(a.snapshot.contains(&canvas.to_string()));
    }

    #[test]
    fn test_row_write_wins_rules() {
        let base = CanvasObject::rect(0.0, 0.0, 1.0, 1.0);
        let old = base.clone().stamped(3, EditorMeta::new("a", "A", 10));
        let new = base.clone().stamped(4, EditorMeta::new("a", "A", 5));

        assert!(row_write_wins(None, &old));
        assert!(row_write_wins(Some(&old), &new));
        assert!(!row_write_wins(Some(&new), &old));
        assert!(row_write_wins(Some(&new), &new.clone()));
    }

    #[test]
    fn test_row_delete_wins_rules() {
        let row = CanvasObject::rect(0.0, 0.0, 1.0, 1.0).stamped(3, EditorMeta::new("bob", "Bob", 30));

        assert!(row_delete_wins(None, &VersionStamp::new(1, 10, "alice")));
        assert!(row_delete_wins(Some(&row), &VersionStamp::new(4, 5, "alice")));
        assert!(!row_delete_wins(Some(&row), &VersionStamp::new(2, 90, "alice")));
        assert!(!row_delete_wins(Some(&row), &VersionStamp::new(3, 20, "alice")));
    }

    #[test]
    fn test_store_error_display() {
        let id = Uuid::new_v4();
        assert!(StoreError::NotFound(id).to_string().contains(&id.to_string()));
        assert!(StoreError::Unavailable("down".into()).to_string().contains("down"));
    }
}
