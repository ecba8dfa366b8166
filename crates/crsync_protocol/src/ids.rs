//! Identifiers and watermarks shared by every peer.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum length of a room identifier.
pub const MAX_ROOM_LEN: usize = 128;

/// Name of one logical database synchronized among peers.
///
/// Room identifiers double as storage file names, so they are restricted to
/// `[A-Za-z0-9_.-]`, must not start with `.`, and are at most
/// [`MAX_ROOM_LEN`] characters long.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Validates and wraps a room identifier.
    pub fn new(room: impl Into<String>) -> ProtocolResult<Self> {
        let room = room.into();
        if room.is_empty() {
            return Err(ProtocolError::invalid_room(room, "empty"));
        }
        if room.len() > MAX_ROOM_LEN {
            return Err(ProtocolError::invalid_room(room, "too long"));
        }
        if room.starts_with('.') {
            return Err(ProtocolError::invalid_room(room, "leading dot"));
        }
        if !room
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
        {
            return Err(ProtocolError::invalid_room(room, "illegal character"));
        }
        Ok(Self(room))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomId> for String {
    fn from(room: RoomId) -> Self {
        room.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one replica (a "site").
///
/// Every database handle and every client has a site id. Changes remember the
/// site they originated from so they are never echoed back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiteId(pub [u8; 16]);

impl SiteId {
    /// Generates a fresh random site id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Creates a site id from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

/// Position in a site's change history.
///
/// Ordered by `db_version`, then by `seq` within one version. A peer's
/// watermark for another site is the position of the last change it applied
/// from that site.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Watermark {
    /// Database version the change was committed at.
    pub db_version: u64,
    /// Position of the change within its version.
    pub seq: u32,
}

impl Watermark {
    /// The origin: nothing seen yet.
    pub const ZERO: Watermark = Watermark {
        db_version: 0,
        seq: 0,
    };

    /// Creates a watermark.
    pub const fn new(db_version: u64, seq: u32) -> Self {
        Self { db_version, seq }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.db_version, self.seq)
    }
}
