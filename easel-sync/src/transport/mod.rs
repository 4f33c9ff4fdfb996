//! Broadcast channels: how change events reach other clients.
//!
//! ```text
//!            send(&event)                     ┌──────────────┐
//! session ─────────────────► BroadcastChannel ─► LocalHub /   │
//!    ▲                            │              │ relay server │
//!    │   ChannelNotice (mpsc)     │              └──────────────┘
//!    └────────────────────────────┘
//!        Event(ChangeEvent) | Status(Connected | Closed | Error)
//! ```
//!
//! Channels are driven from the session task and never block it: `connect`
//! spawns the connection work and reports the outcome as a notice, and
//! `send` is fire-and-forget.

pub mod local;
pub mod ws;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::ChangeEvent;

pub use local::{LocalChannel, LocalHub};
pub use ws::WsChannel;

/// Connection-level status reported by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Connected,
    /// Orderly close; no reconnect is scheduled.
    Closed,
    /// Loss or failed attempt; the supervisor backs off and retries.
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotice {
    Event(ChangeEvent),
    Status(ChannelStatus),
}

pub type NoticeSink = mpsc::UnboundedSender<ChannelNotice>;

/// Transport errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Channel not connected")]
    NotConnected,
    #[error("Send buffer full")]
    Backpressure,
    #[error("Encoding failed: {0}")]
    Encode(String),
    #[error("Connection failed: {0}")]
    Connect(String),
}

/// A publish/subscribe channel scoped to one canvas.
pub trait BroadcastChannel: Send {
    /// Start connecting to `canvas_id`. The outcome arrives on `sink`.
    ///
    /// Calling this while connected drops the old connection first.
    fn connect(&mut self, canvas_id: Uuid, sink: NoticeSink) -> Result<(), TransportError>;

    /// Publish an event to the other subscribers.
    fn send(&self, event: &ChangeEvent) -> Result<(), TransportError>;

    /// Drop the connection without emitting a status notice.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}
