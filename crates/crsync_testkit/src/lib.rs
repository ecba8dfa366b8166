//! # crsync Testkit
//!
//! Test utilities for crsync.
//!
//! This crate provides:
//! - Temporary room directories and change builders
//! - Helpers that replay changes between replicas
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use crsync_testkit::prelude::*;
//! use crsync_store::{Database, StorageEngine};
//!
//! let rooms = TempRooms::new();
//! let db = rooms.open(&room("notes")).unwrap();
//! assert_eq!(db.db_version().unwrap(), 0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
