//! # easel-sync — realtime object synchronization for Easel canvases
//!
//! Keeps many clients' copies of a canvas converging without a central lock:
//! per-object versions, last-writer-wins resolution, a durable offline queue
//! and reconnect with backoff.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  ChangeEvent   ┌─────────────┐  ChangeEvent  ┌──────────────┐
//! │ SyncSession  │ ◄────────────► │ RelayServer │ ◄───────────► │ SyncSession  │
//! │ (client A)   │   WebSocket    │ (rooms)     │               │ (client B)   │
//! └──────┬───────┘                └─────────────┘               └──────┬───────┘
//!        │ debounced flush                                             │
//!        ▼                                                             ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │ RowStore (durable rows, same LWW rule)                                   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`] — object map, local/remote change application, reconciliation
//! - [`session`] — actor task with debouncing, reconnect timers and a handle
//! - [`oplog`] — durable offline queue with per-object coalescing
//! - [`snapshot`] — last known-good object set
//! - [`tombstone`] — deletion markers with retention
//! - [`supervisor`] — connection state machine and backoff
//! - [`protocol`] — wire events and relay frames
//! - [`transport`] — in-process and WebSocket broadcast channels
//! - [`relay`] — WebSocket relay server
//! - [`storage`] — row store and local storage backends (memory, RocksDB)

pub mod config;
pub mod engine;
pub mod error;
pub mod oplog;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod supervisor;
pub mod time;
pub mod tombstone;
pub mod transport;

pub use config::SyncConfig;
pub use engine::{
    ClientIdentity, ConnectionStatus, EngineParts, EngineStats, LocalChangeReport, ReconcileReport,
    RemoteOutcome, SyncEngine,
};
pub use error::{SyncError, SyncResult};
pub use oplog::{FlushReport, LoadOutcome, OperationKind, OperationLog, QueuedOperation};
pub use protocol::{Change, ChangeEvent, ProtocolError, RelayFrame};
pub use relay::{RelayConfig, RelayError, RelayServer, RelayStats};
pub use session::{SessionHandle, SessionStats, SyncSession};
pub use snapshot::{Snapshot, SnapshotLoad, SnapshotStore};
pub use storage::{
    LocalStorage, MemoryRowStore, MemoryStorage, RocksStore, RowStore, StorageKeys, StoreConfig,
    StoreError, StoreWrite,
};
pub use supervisor::{ConnectionSupervisor, LinkState, SupervisorAction};
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
pub use tombstone::{Tombstone, TombstoneSet};
pub use transport::{
    BroadcastChannel, ChannelNotice, ChannelStatus, LocalChannel, LocalHub, NoticeSink,
    TransportError, WsChannel,
};
