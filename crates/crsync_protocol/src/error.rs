//! Error types for protocol encoding and validation.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while building, encoding or decoding protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// A frame could not be decoded into a message.
    #[error("decode error: {0}")]
    Decode(String),

    /// A room identifier failed validation.
    #[error("invalid room id {room:?}: {reason}")]
    InvalidRoom {
        /// The offending identifier.
        room: String,
        /// Why it was rejected.
        reason: &'static str,
    },
}

impl ProtocolError {
    /// Creates an invalid room error.
    pub fn invalid_room(room: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidRoom {
            room: room.into(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::invalid_room("../etc", "illegal character");
        let msg = err.to_string();
        assert!(msg.contains("../etc"));
        assert!(msg.contains("illegal character"));
    }
}
