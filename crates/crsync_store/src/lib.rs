//! # crsync Store
//!
//! Storage engine interface and reference engines for crsync rooms.
//!
//! The sync server treats each room as an opaque CRDT database reached
//! through [`StorageEngine`] and [`Database`]. This crate defines those
//! traits and ships two engines that merge changes with per-column
//! last-writer-wins semantics.
//!
//! ## Design Principles
//!
//! - One open handle per room; a second open fails with [`StoreError::Locked`]
//! - Changesets are validated before anything is mutated or written
//! - Per-peer watermarks make re-sent batches detectable
//! - Handle methods are blocking and must be called off the async runtime
//!
//! ## Available Engines
//!
//! - [`MemoryEngine`] - For testing, with fault injection
//! - [`FileEngine`] - One append-only log per room, replayed on open
//!
//! ## Example
//!
//! ```rust
//! use crsync_store::{Database, MemoryEngine, StorageEngine};
//! use crsync_protocol::{RoomId, Value, Watermark};
//!
//! let engine = MemoryEngine::new();
//! let db = engine.open(&RoomId::new("notes").unwrap()).unwrap();
//! db.write_local("todo", &[1], "title", Value::Text("milk".into())).unwrap();
//! let changes = db.changes_since(Watermark::ZERO, &[], 100).unwrap();
//! assert_eq!(changes.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod file;
mod inspect;
mod log;
mod memory;
mod state;

pub use engine::{ApplyOutcome, Database, RejectReason, StorageEngine};
pub use error::{StoreError, StoreResult};
pub use file::{FileDatabase, FileEngine, LOCK_EXTENSION, LOG_EXTENSION};
pub use inspect::{inspect_room, RoomSummary};
pub use memory::{Fault, MemoryDatabase, MemoryEngine};
