//! Error types for the relay

use thiserror::Error;

use crate::{ConnectionId, MediaKind};

/// Core relay errors
#[derive(Error, Debug)]
pub enum SwarmcastError {
    // Wire errors
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    // Capture / discovery errors
    #[error("Capture source unavailable after {attempts} attempts")]
    DiscoverySourceUnavailable { attempts: u32 },

    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    // Codec errors
    #[error("{kind} encode failed: {reason}")]
    EncodeFailure { kind: MediaKind, reason: String },

    #[error("{kind} decode failed: {reason}")]
    DecodeFailure { kind: MediaKind, reason: String },

    #[error("{0} codec engine is not configured")]
    CodecNotConfigured(MediaKind),

    // Transport errors
    #[error("Write to connection {connection} failed: {reason}")]
    TransportWriteFailure {
        connection: ConnectionId,
        reason: String,
    },

    #[error("Write to connection {0} timed out")]
    WriteTimeout(ConnectionId),

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    // Lifecycle errors
    #[error("Relay already joined a topic")]
    AlreadyJoined,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SwarmcastError {
    /// Errors that end the connection they occurred on
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            SwarmcastError::TransportWriteFailure { .. }
                | SwarmcastError::WriteTimeout(_)
                | SwarmcastError::TransportClosed(_)
        )
    }

    /// Errors that are healed by the next keyframe
    pub fn needs_resync(&self) -> bool {
        matches!(
            self,
            SwarmcastError::MalformedFrame(_)
                | SwarmcastError::EncodeFailure { .. }
                | SwarmcastError::DecodeFailure { .. }
        )
    }
}

/// Result type for relay operations
pub type SwarmcastResult<T> = Result<T, SwarmcastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let write = SwarmcastError::TransportWriteFailure {
            connection: ConnectionId::new(2),
            reason: "broken pipe".into(),
        };
        assert!(write.is_connection_fatal());
        assert!(!write.needs_resync());

        let decode = SwarmcastError::DecodeFailure {
            kind: MediaKind::Video,
            reason: "corrupt slice".into(),
        };
        assert!(decode.needs_resync());
        assert!(!decode.is_connection_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = SwarmcastError::DiscoverySourceUnavailable { attempts: 30 };
        assert_eq!(err.to_string(), "Capture source unavailable after 30 attempts");
    }
}
