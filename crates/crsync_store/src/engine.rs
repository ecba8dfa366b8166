//! Storage engine interface.

use crate::error::StoreResult;
use crsync_protocol::{Change, RoomId, Schema, SiteId, Value, Watermark};
use std::fmt;
use tokio::sync::watch;

/// Opens room databases.
///
/// The sync server never interprets changes itself; it goes through this
/// interface and the [`Database`] handles it returns.
pub trait StorageEngine: Send + Sync + 'static {
    /// Handle type returned by [`StorageEngine::open`].
    type Handle: Database;

    /// Opens the database for `room`, creating it if missing.
    ///
    /// May block on I/O.
    ///
    /// # Errors
    ///
    /// Returns an error if the room cannot be opened, including when another
    /// handle for the same room is still open.
    fn open(&self, room: &RoomId) -> StoreResult<Self::Handle>;
}

/// An open connection to one room's database.
///
/// # Invariants
///
/// - Every method except [`Database::room`], [`Database::site_id`],
///   [`Database::subscribe`] and [`Database::is_closed`] fails with
///   [`crate::StoreError::Closed`] once [`Database::close`] has run
/// - A rejected changeset leaves the database untouched
/// - Applying an already-applied change is a no-op
pub trait Database: Send + Sync + 'static {
    /// Room this handle belongs to.
    fn room(&self) -> &RoomId;

    /// Site id of this replica.
    fn site_id(&self) -> SiteId;

    /// Current local database version.
    fn db_version(&self) -> StoreResult<u64>;

    /// Records `schema` for the room, or checks it against the recorded one.
    fn ensure_schema(&self, schema: &Schema) -> StoreResult<()>;

    /// Applies a batch of changes received from `sender`.
    ///
    /// `since` must equal [`Database::last_seen`] for `sender`; otherwise the
    /// batch is rejected as out of order.
    fn apply_changeset(
        &self,
        sender: SiteId,
        since: Watermark,
        changes: &[Change],
    ) -> StoreResult<ApplyOutcome>;

    /// Returns up to `limit` current changes recorded after `since`, in
    /// watermark order, skipping changes that originated at `exclude` sites.
    fn changes_since(
        &self,
        since: Watermark,
        exclude: &[SiteId],
        limit: usize,
    ) -> StoreResult<Vec<Change>>;

    /// Last watermark applied from `peer`.
    fn last_seen(&self, peer: &SiteId) -> StoreResult<Watermark>;

    /// Writes a column locally, as this replica.
    fn write_local(&self, table: &str, pk: &[u8], cid: &str, val: Value) -> StoreResult<Change>;

    /// Subscribes to database version changes.
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Flushes and closes the handle.
    fn close(&self) -> StoreResult<()>;

    /// Returns true once the handle is closed.
    fn is_closed(&self) -> bool;
}

/// Result of [`Database::apply_changeset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The batch was merged.
    Accepted {
        /// Sender watermark after the batch.
        last_seen: Watermark,
        /// Number of changes that won the merge.
        applied: usize,
    },
    /// The batch was not applied.
    Rejected {
        /// Why the batch was rejected.
        reason: RejectReason,
        /// Sender watermark the receiver still holds.
        last_seen: Watermark,
    },
}

impl ApplyOutcome {
    /// Returns true if the batch was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, ApplyOutcome::Accepted { .. })
    }
}

/// Why a changeset was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The batch does not continue from the receiver's watermark.
    OutOfOrder {
        /// Watermark the receiver expected.
        expected: Watermark,
        /// Watermark the batch claimed to continue from.
        got: Watermark,
    },
    /// The batch is structurally invalid.
    Malformed(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::OutOfOrder { expected, got } => {
                write!(f, "out of order: expected changes since {expected}, got since {got}")
            }
            RejectReason::Malformed(msg) => write!(f, "malformed changeset: {msg}"),
        }
    }
}
