//! Test fixtures and room helpers.
//!
//! Provides convenience functions for setting up room directories,
//! building changes and replaying them between replicas.

use crsync_protocol::{AnnouncePresence, Change, RoomId, Schema, SiteId, Value, Watermark};
use crsync_store::{ApplyOutcome, Database, FileEngine, StoreResult};
use std::path::Path;
use tempfile::TempDir;

/// Schema used by test clients unless a test needs another one.
pub fn test_schema() -> Schema {
    Schema::new("todo", 1)
}

/// Builds a room id, panicking on invalid names.
pub fn room(name: &str) -> RoomId {
    RoomId::new(name).expect("valid room name")
}

/// Builds a deterministic site id from one byte.
pub fn site(n: u8) -> SiteId {
    SiteId::from_bytes([n; 16])
}

/// Builds an announcement for `room` from `sender` with no history.
pub fn announce(room_name: &str, sender: SiteId) -> AnnouncePresence {
    AnnouncePresence::new(room(room_name), sender, test_schema())
}

/// Builds a change originating at `origin`.
///
/// The change writes `val` to column `cid` of row `pk` in table `todo`, at
/// column version 1 and watermark `db_version:0`.
pub fn make_change(origin: SiteId, db_version: u64, pk: &[u8], cid: &str, val: Value) -> Change {
    Change {
        table: "todo".into(),
        pk: pk.to_vec(),
        cid: cid.into(),
        val,
        col_version: 1,
        db_version,
        seq: 0,
        site_id: origin,
    }
}

/// Builds `count` changes from `origin` at versions `first..first + count`,
/// each writing a distinct row.
pub fn change_run(origin: SiteId, first: u64, count: u64) -> Vec<Change> {
    (first..first + count)
        .map(|v| {
            make_change(
                origin,
                v,
                &v.to_be_bytes(),
                "title",
                Value::Text(format!("row {v}")),
            )
        })
        .collect()
}

/// A file engine in a temporary directory, removed on drop.
pub struct TempRooms {
    engine: FileEngine,
    // Declared after the engine so handles close before the directory goes.
    dir: TempDir,
}

impl TempRooms {
    /// Creates an empty room directory.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let engine = FileEngine::open(dir.path()).expect("Failed to open file engine");
        Self { engine, dir }
    }

    /// Directory holding the room files.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Returns a clone of the engine.
    pub fn engine(&self) -> FileEngine {
        self.engine.clone()
    }
}

impl Default for TempRooms {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TempRooms {
    type Target = FileEngine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// Pushes everything `from` has that `to` has not seen yet, the way a sync
/// session would, and returns the outcome.
///
/// Changes that originated at `to` are not sent back.
pub fn push_changes<A, B>(from: &A, to: &B, batch_size: usize) -> StoreResult<ApplyOutcome>
where
    A: Database + ?Sized,
    B: Database + ?Sized,
{
    let sender = from.site_id();
    let mut since: Watermark = to.last_seen(&sender)?;
    let mut outcome = ApplyOutcome::Accepted {
        last_seen: since,
        applied: 0,
    };
    loop {
        let batch = from.changes_since(since, &[to.site_id()], batch_size)?;
        if batch.is_empty() {
            return Ok(outcome);
        }
        outcome = to.apply_changeset(sender, since, &batch)?;
        match &outcome {
            ApplyOutcome::Accepted { last_seen, .. } => since = *last_seen,
            ApplyOutcome::Rejected { .. } => return Ok(outcome),
        }
    }
}

/// Returns the current cells of `db` as `(table, pk, cid, value)` tuples in
/// key order, ignoring versions.
pub fn snapshot<D: Database + ?Sized>(db: &D) -> StoreResult<Vec<(String, Vec<u8>, String, Value)>> {
    let mut cells: Vec<_> = db
        .changes_since(Watermark::ZERO, &[], usize::MAX)?
        .into_iter()
        .map(|c| (c.table, c.pk, c.cid, c.val))
        .collect();
    cells.sort_by(|a, b| (&a.0, &a.1, &a.2).cmp(&(&b.0, &b.1, &b.2)));
    Ok(cells)
}
