//! Umbrella error type for the sync layer.

use crate::protocol::ProtocolError;
use crate::storage::StoreError;
use crate::transport::TransportError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Sync session is closed")]
    SessionClosed,
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_conversions() {
        let err: SyncError = StoreError::Unavailable("down".into()).into();
        assert!(matches!(err, SyncError::Store(_)));
        assert!(err.to_string().contains("down"));

        let err: SyncError = ProtocolError::Invalid("bad".into()).into();
        assert!(matches!(err, SyncError::Protocol(_)));

        let err: SyncError = TransportError::NotConnected.into();
        assert!(err.to_string().contains("not connected"));
    }
}
