//! # easel-core — canvas data model and versioning primitives
//!
//! Pure building blocks shared by the sync engine: no I/O, no async.
//!
//! - [`object`] — `CanvasObject` and its sync metadata
//! - [`clock`] — Lamport clock issuing per-object versions
//! - [`resolver`] — last-writer-wins decision between two stamps
//! - [`diff`] — turning a proposed object set into creates/updates/deletes

pub mod clock;
pub mod diff;
pub mod object;
pub mod resolver;

pub use clock::LogicalClock;
pub use diff::{diff_objects, ObjectDiff};
pub use object::{CanvasObject, Color, EditorMeta, ObjectId, ShapeKind, TextAlign, TextBlock};
pub use resolver::{ApplyReason, ConflictResolver, Resolution, StaleReason, VersionStamp};
