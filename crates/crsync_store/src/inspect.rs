//! Offline inspection of room logs.

use crate::error::StoreResult;
use crate::file::{replay_state, room_file, LOG_EXTENSION};
use crate::log::{LogRecord, RoomLog};
use crsync_protocol::RoomId;
use serde::Serialize;
use std::path::Path;

/// Summary of one room log.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    /// Room name.
    pub room: String,
    /// Site id of the room's replica.
    pub site_id: String,
    /// Recorded schema, as `name@version`.
    pub schema: Option<String>,
    /// Current database version.
    pub db_version: u64,
    /// Number of live cells.
    pub cells: usize,
    /// Total records in the log.
    pub records: usize,
    /// Accepted changesets.
    pub changesets: usize,
    /// Local writes.
    pub local_writes: usize,
    /// Size of the log in bytes.
    pub log_bytes: u64,
    /// Bytes of a partial record at the end of the log.
    pub torn_bytes: u64,
    /// Last watermark seen from each peer, as `(site, "version:seq")`.
    pub peers: Vec<(String, String)>,
}

/// Reads the log of `room` under `dir` without modifying it.
///
/// Safe to run while a server has the room open.
///
/// # Errors
///
/// Returns an error if the log is missing or corrupted.
pub fn inspect_room(dir: &Path, room: &RoomId) -> StoreResult<RoomSummary> {
    let mut log = RoomLog::open_read_only(&room_file(dir, room, LOG_EXTENSION))?;
    let replay = log.read_all()?;

    let records = replay.records.len();
    let changesets = count(&replay.records, |r| matches!(r, LogRecord::Apply { .. }));
    let local_writes = count(&replay.records, |r| matches!(r, LogRecord::Local { .. }));
    let state = replay_state(replay.records)?;

    Ok(RoomSummary {
        room: room.to_string(),
        site_id: state.site_id().to_string(),
        schema: state.schema().map(ToString::to_string),
        db_version: state.db_version(),
        cells: state.cell_count(),
        records,
        changesets,
        local_writes,
        log_bytes: log.size(),
        torn_bytes: replay.torn_len,
        peers: state
            .peers()
            .into_iter()
            .map(|(site, seen)| (site.to_string(), seen.to_string()))
            .collect(),
    })
}

fn count(records: &[LogRecord], pred: impl Fn(&LogRecord) -> bool) -> usize {
    records.iter().filter(|r| pred(r)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Database, StorageEngine};
    use crate::file::FileEngine;
    use crsync_protocol::{Change, Schema, SiteId, Value, Watermark};
    use tempfile::tempdir;

    #[test]
    fn inspect_summarizes_room() {
        let dir = tempdir().unwrap();
        let engine = FileEngine::open(dir.path()).unwrap();
        let room = RoomId::new("notes").unwrap();
        let peer = SiteId::from_bytes([3; 16]);

        let db = engine.open(&room).unwrap();
        db.ensure_schema(&Schema::new("todo", 4)).unwrap();
        db.write_local("todo", &[1], "title", Value::Text("a".into()))
            .unwrap();
        db.apply_changeset(
            peer,
            Watermark::ZERO,
            &[Change {
                table: "todo".into(),
                pk: vec![2],
                cid: "title".into(),
                val: Value::Text("b".into()),
                col_version: 1,
                db_version: 5,
                seq: 0,
                site_id: peer,
            }],
        )
        .unwrap();

        // The room is still open; inspection only reads.
        let summary = inspect_room(dir.path(), &room).unwrap();
        assert_eq!(summary.room, "notes");
        assert_eq!(summary.site_id, db.site_id().to_string());
        assert_eq!(summary.schema.as_deref(), Some("todo@4"));
        assert_eq!(summary.db_version, 2);
        assert_eq!(summary.cells, 2);
        assert_eq!(summary.records, 4);
        assert_eq!(summary.changesets, 1);
        assert_eq!(summary.local_writes, 1);
        assert_eq!(summary.torn_bytes, 0);
        assert_eq!(summary.peers, vec![(peer.to_string(), "5:0".to_string())]);
        db.close().unwrap();
    }

    #[test]
    fn inspect_missing_room_fails() {
        let dir = tempdir().unwrap();
        let room = RoomId::new("missing").unwrap();
        assert!(inspect_room(dir.path(), &room).is_err());
    }
}
