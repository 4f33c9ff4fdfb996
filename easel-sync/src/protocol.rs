//! Wire types for change broadcast.
//!
//! Every change travels as a [`ChangeEvent`]: a tagged union of
//! create/update/delete plus the version stamp and author. Events are
//! validated at the boundary, before they reach the engine.
//!
//! Relay framing (bincode-encoded [`RelayFrame`]):
//! ```text
//! client ── Join{canvas, client} ──► relay
//! client ── Change(event) ─────────► relay ── Change(event) ──► other peers
//! client ── Leave ─────────────────► relay
//! ```

use easel_core::{CanvasObject, EditorMeta, ObjectId, VersionStamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened to the object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Created(CanvasObject),
    Updated(CanvasObject),
    Deleted { object_id: ObjectId },
}

impl Change {
    pub fn object_id(&self) -> ObjectId {
        match self {
            Change::Created(obj) | Change::Updated(obj) => obj.id,
            Change::Deleted { object_id } => *object_id,
        }
    }

    pub fn object(&self) -> Option<&CanvasObject> {
        match self {
            Change::Created(obj) | Change::Updated(obj) => Some(obj),
            Change::Deleted { .. } => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Change::Created(_) => "created",
            Change::Updated(_) => "updated",
            Change::Deleted { .. } => "deleted",
        }
    }
}

/// A single stamped change to one object of one canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub canvas_id: Uuid,
    /// Client that issued the change; used to drop echoes.
    pub origin: Uuid,
    pub change: Change,
    pub version: u64,
    pub user_id: String,
    pub user_name: String,
    pub timestamp_millis: u64,
}

impl ChangeEvent {
    pub fn new(canvas_id: Uuid, origin: Uuid, change: Change, version: u64, meta: &EditorMeta) -> Self {
        Self {
            canvas_id,
            origin,
            change,
            version,
            user_id: meta.user_id.clone(),
            user_name: meta.user_name.clone(),
            timestamp_millis: meta.timestamp_millis,
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.change.object_id()
    }

    pub fn meta(&self) -> EditorMeta {
        EditorMeta::new(self.user_id.clone(), self.user_name.clone(), self.timestamp_millis)
    }

    pub fn stamp(&self) -> VersionStamp {
        VersionStamp::new(self.version, self.timestamp_millis, self.user_id.clone())
    }

    /// Reject malformed events before they reach the engine.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.version == 0 {
            return Err(ProtocolError::Invalid("version must be non-zero".into()));
        }
        if self.user_id.is_empty() {
            return Err(ProtocolError::Invalid("user_id must not be empty".into()));
        }
        if self.object_id().is_nil() {
            return Err(ProtocolError::Invalid("object id must not be nil".into()));
        }
        if let Some(obj) = self.change.object() {
            if obj.version != self.version {
                return Err(ProtocolError::Invalid(format!(
                    "object version {} does not match event version {}",
                    obj.version, self.version
                )));
            }
        }
        Ok(())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format and validate.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Parse a loosely-typed JSON payload and validate it.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let event: Self =
            serde_json::from_str(json).map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }
}

/// Frames exchanged with the relay server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    Join { canvas_id: Uuid, client_id: Uuid },
    Change(ChangeEvent),
    Leave,
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode a frame; change frames are validated.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if let RelayFrame::Change(event) = &frame {
            event.validate()?;
        }
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid event: {0}")]
    Invalid(String),
}
