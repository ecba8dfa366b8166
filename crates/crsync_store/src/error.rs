//! Error types for storage operations.

use crsync_protocol::{RoomId, Schema};
use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The room log is corrupted.
    #[error("room log corrupted: {0}")]
    Corrupted(String),

    /// The handle has been closed.
    #[error("database handle is closed")]
    Closed,

    /// Another handle already holds the room open.
    #[error("room {0} is already open")]
    Locked(RoomId),

    /// A log record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The room was created with a different schema.
    #[error("schema mismatch: room uses {expected}, peer runs {found}")]
    SchemaMismatch {
        /// Schema recorded for the room.
        expected: Schema,
        /// Schema the caller asked for.
        found: Schema,
    },
}

impl StoreError {
    /// Returns true if the error means the handle was already closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, StoreError::Closed)
    }
}
