//! Error types for the sync server.

use crsync_protocol::{MsgTag, ProtocolError, RoomId, SiteId};
use crsync_store::StoreError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The peer broke the protocol. Fatal to its connection.
    #[error("protocol violation: {0}")]
    Violation(#[from] ProtocolViolation),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// The storage engine failed.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// The transport is closed; nothing more can be sent.
    #[error("transport closed")]
    TransportClosed,

    /// The server is shutting down and accepts no new work.
    #[error("server is shutting down")]
    ShuttingDown,

    /// WebSocket failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if the peer caused this error.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, ServerError::Violation(_) | ServerError::Codec(_))
    }

    /// Returns true if the storage engine caused this error.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, ServerError::Store(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ServerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ServerError::WebSocket(err.to_string())
    }
}

/// A message that is illegal in the connection's current state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// The connection is already bound to a room.
    #[error("connection already announced presence in room {room}")]
    AlreadyAnnounced {
        /// Room the connection is bound to.
        room: RoomId,
    },

    /// A session message arrived before `AnnouncePresence`.
    #[error("received {tag} before AnnouncePresence")]
    NoSession {
        /// Offending message.
        tag: MsgTag,
    },

    /// A server-to-client message arrived at the server.
    #[error("servers do not process {tag}")]
    ServerBound {
        /// Offending message.
        tag: MsgTag,
    },

    /// A message named a room other than the bound one.
    #[error("message for room {received} on a connection bound to {bound}")]
    RoomMismatch {
        /// Room the connection is bound to.
        bound: RoomId,
        /// Room the message named.
        received: RoomId,
    },

    /// A message named the wrong site.
    #[error("message names site {received}, expected {expected}")]
    SiteMismatch {
        /// Site the message should name.
        expected: SiteId,
        /// Site the message named.
        received: SiteId,
    },

    /// A message arrived after the connection closed.
    #[error("received {tag} on a closed connection")]
    ConnectionClosed {
        /// Offending message.
        tag: MsgTag,
    },

    /// The transport delivered a frame the protocol does not use.
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    /// The frame exceeds the configured limit.
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Frame size.
        size: usize,
        /// Configured limit.
        max: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        let violation: ServerError = ProtocolViolation::NoSession {
            tag: MsgTag::Changes,
        }
        .into();
        assert!(violation.is_protocol_violation());
        assert!(!violation.is_storage_failure());

        let store: ServerError = StoreError::Closed.into();
        assert!(store.is_storage_failure());
        assert!(!store.is_protocol_violation());

        assert!(ServerError::Codec(ProtocolError::Decode("x".into())).is_protocol_violation());
        assert!(!ServerError::TransportClosed.is_protocol_violation());
    }

    #[test]
    fn error_display() {
        let err = ServerError::from(ProtocolViolation::ServerBound {
            tag: MsgTag::StartStreaming,
        });
        assert_eq!(
            err.to_string(),
            "protocol violation: servers do not process StartStreaming"
        );

        let err = ProtocolViolation::FrameTooLarge { size: 10, max: 5 };
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains("5"));
    }
}
