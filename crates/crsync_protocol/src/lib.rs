//! # crsync Protocol
//!
//! Wire types and CBOR codec for the crsync replication protocol.
//!
//! This crate provides:
//! - [`RoomId`], [`SiteId`] and [`Watermark`]
//! - [`Change`] and [`Value`], the unit of replication
//! - Protocol messages ([`Msg`]): presence, changes, rejections, stream start
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Message flow
//!
//! 1. Client sends `AnnouncePresence` naming the room and what it has seen
//! 2. Server answers `StartStreaming` with the watermark it has from the client
//! 3. Both sides push `Changes`; a side that cannot apply a batch answers
//!    `RejectChanges` with its current watermark so the sender can resume

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod error;
mod ids;
mod messages;

pub use change::{Change, Schema, Value};
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{RoomId, SiteId, Watermark, MAX_ROOM_LEN};
pub use messages::{AnnouncePresence, Changes, Msg, MsgTag, RejectChanges, StartStreaming};
