//! Protocol messages.
//!
//! Every message travels in its own transport frame, CBOR encoded and
//! internally tagged by `_tag`.

use crate::change::{Change, Schema};
use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{RoomId, SiteId, Watermark};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message tag, used for dispatch and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgTag {
    /// Client announces itself and the room it wants to sync.
    AnnouncePresence,
    /// A batch of changes.
    Changes,
    /// A batch of changes could not be applied.
    RejectChanges,
    /// The sender asks the receiver to begin streaming changes.
    StartStreaming,
}

impl MsgTag {
    /// Returns the numeric code of the tag.
    pub fn code(&self) -> u8 {
        match self {
            MsgTag::AnnouncePresence => 1,
            MsgTag::Changes => 2,
            MsgTag::RejectChanges => 3,
            MsgTag::StartStreaming => 4,
        }
    }
}

impl fmt::Display for MsgTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MsgTag::AnnouncePresence => "AnnouncePresence",
            MsgTag::Changes => "Changes",
            MsgTag::RejectChanges => "RejectChanges",
            MsgTag::StartStreaming => "StartStreaming",
        };
        f.write_str(name)
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum Msg {
    /// Client → server: bind this connection to a room.
    AnnouncePresence(AnnouncePresence),
    /// Either direction: changes to apply.
    Changes(Changes),
    /// Either direction: the previous changes were not applied.
    RejectChanges(RejectChanges),
    /// Server → client: begin streaming changes from `since`.
    StartStreaming(StartStreaming),
}

impl Msg {
    /// Returns the tag of this message.
    pub fn tag(&self) -> MsgTag {
        match self {
            Msg::AnnouncePresence(_) => MsgTag::AnnouncePresence,
            Msg::Changes(_) => MsgTag::Changes,
            Msg::RejectChanges(_) => MsgTag::RejectChanges,
            Msg::StartStreaming(_) => MsgTag::StartStreaming,
        }
    }

    /// Returns the room this message refers to.
    pub fn room(&self) -> &RoomId {
        match self {
            Msg::AnnouncePresence(m) => &m.room,
            Msg::Changes(m) => &m.room,
            Msg::RejectChanges(m) => &m.room,
            Msg::StartStreaming(m) => &m.room,
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Presence announcement sent by a client right after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnouncePresence {
    /// Room to bind the connection to.
    pub room: RoomId,
    /// The client's site id.
    pub sender: SiteId,
    /// What the client has already seen from other sites.
    pub last_seens: Vec<(SiteId, Watermark)>,
    /// Schema the client runs.
    pub schema: Schema,
}

impl AnnouncePresence {
    /// Creates an announcement with no prior history.
    pub fn new(room: RoomId, sender: SiteId, schema: Schema) -> Self {
        Self {
            room,
            sender,
            last_seens: Vec::new(),
            schema,
        }
    }

    /// Adds a last-seen watermark for a site.
    pub fn with_last_seen(mut self, site: SiteId, seen: Watermark) -> Self {
        self.last_seens.push((site, seen));
        self
    }

    /// Returns what the client has seen from `site`.
    pub fn last_seen_for(&self, site: &SiteId) -> Watermark {
        self.last_seens
            .iter()
            .find(|(s, _)| s == site)
            .map(|(_, w)| *w)
            .unwrap_or(Watermark::ZERO)
    }
}

/// A batch of changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changes {
    /// Room the changes belong to.
    pub room: RoomId,
    /// Site that sent the batch.
    pub sender: SiteId,
    /// Sender watermark the batch continues from.
    pub since: Watermark,
    /// Changes in ascending watermark order.
    pub changes: Vec<Change>,
}

impl Changes {
    /// Returns the watermark reached after this batch.
    pub fn until(&self) -> Watermark {
        self.changes
            .last()
            .map(Change::watermark)
            .unwrap_or(self.since)
    }
}

/// Notice that a batch of changes was not applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectChanges {
    /// Room the rejected changes belong to.
    pub room: RoomId,
    /// Site whose changes were rejected.
    pub whose: SiteId,
    /// Last watermark the rejecting side applied from `whose`.
    pub since: Watermark,
    /// Human-readable reason.
    pub reason: String,
}

/// Request to begin streaming changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartStreaming {
    /// Room to stream.
    pub room: RoomId,
    /// Stream changes after this watermark.
    pub since: Watermark,
    /// Do not send changes that originated at these sites.
    pub exclude_sites: Vec<SiteId>,
    /// Only send changes that originated locally.
    pub local_only: bool,
}
