//! # crsync Sync Server
//!
//! WebSocket replication broker for CRDT room databases.
//!
//! This crate provides:
//! - A shared, TTL-evicted cache of open room databases
//! - A per-connection broker that enforces the sync protocol
//! - Sync sessions that merge inbound changes and stream outbound ones
//! - A WebSocket transport and the accept loop around it
//!
//! # Architecture
//!
//! Every connection gets a [`ConnectionBroker`]. Its first message must be
//! `AnnouncePresence`, which binds it to a room: the broker leases the room
//! database from the [`DbCache`] and starts a [`SyncSession`]. The session
//! answers with `StartStreaming`, applies inbound `Changes` with causal
//! checks, and streams local changes the peer has not seen in chunks.
//!
//! Connections to the same room share one open database. A room is closed
//! once it has been unused for the cache TTL.
//!
//! Any protocol violation or storage failure closes the offending connection
//! only.
//!
//! # Example
//!
//! ```no_run
//! use crsync_server::{ServerConfig, SyncServer};
//! use crsync_store::FileEngine;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::new("0.0.0.0:8080".parse()?).with_cache_ttl_secs(120);
//! let server = SyncServer::new(config, FileEngine::open(std::path::Path::new("./rooms"))?);
//! let listener = server.bind().await?;
//! server.serve(listener).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code must not panic; errors close the connection instead.
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod broker;
mod cache;
mod config;
mod error;
mod server;
mod session;
mod transport;
mod ws;

pub use broker::{BrokerState, ConnectionBroker};
pub use cache::{DbCache, DbLease};
pub use config::{ServerConfig, DEFAULT_CACHE_TTL};
pub use error::{ProtocolViolation, ServerError, ServerResult};
pub use server::SyncServer;
pub use session::SyncSession;
pub use transport::Transport;
pub use ws::serve_connection;
