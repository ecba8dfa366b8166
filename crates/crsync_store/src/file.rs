//! File-based storage engine for persistent rooms.

use crate::engine::{ApplyOutcome, Database, StorageEngine};
use crate::error::{StoreError, StoreResult};
use crate::log::{LogRecord, RoomLog};
use crate::state::RoomState;
use crsync_protocol::{Change, RoomId, Schema, SiteId, Value, Watermark};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Extension of room log files.
pub const LOG_EXTENSION: &str = "crlog";

/// Extension of room lock files.
pub const LOCK_EXTENSION: &str = "lock";

/// A storage engine that keeps one log file per room in a directory.
///
/// Room `r` lives in `<dir>/r.crlog`, guarded by an exclusive lock on
/// `<dir>/r.lock` for as long as a handle is open. The lock is advisory and
/// process-wide, so a room cannot be opened twice even from two processes.
///
/// # Durability
///
/// Every accepted changeset, local write and schema record is synced to disk
/// before the call returns.
///
/// # Example
///
/// ```no_run
/// use crsync_store::{Database, FileEngine, StorageEngine};
/// use crsync_protocol::RoomId;
/// use std::path::Path;
///
/// let engine = FileEngine::open(Path::new("rooms")).unwrap();
/// let db = engine.open(&RoomId::new("notes").unwrap()).unwrap();
/// db.close().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct FileEngine {
    dir: PathBuf,
}

impl FileEngine {
    /// Creates an engine rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Directory holding the room files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for `room`.
    #[must_use]
    pub fn log_path(&self, room: &RoomId) -> PathBuf {
        room_file(&self.dir, room, LOG_EXTENSION)
    }

    fn lock_path(&self, room: &RoomId) -> PathBuf {
        room_file(&self.dir, room, LOCK_EXTENSION)
    }
}

pub(crate) fn room_file(dir: &Path, room: &RoomId, extension: &str) -> PathBuf {
    dir.join(format!("{}.{extension}", room.as_str()))
}

impl StorageEngine for FileEngine {
    type Handle = FileDatabase;

    fn open(&self, room: &RoomId) -> StoreResult<FileDatabase> {
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path(room))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(room.clone()));
        }

        let mut log = RoomLog::open(&self.log_path(room))?;
        let replay = log.read_all()?;
        if replay.torn_len > 0 {
            warn!(
                room = %room,
                torn_bytes = replay.torn_len,
                "Discarding partial record at end of room log"
            );
            log.truncate(replay.valid_len)?;
        }

        let state = if replay.records.is_empty() {
            let site = SiteId::random();
            log.append(&LogRecord::Site(site))?;
            log.sync()?;
            debug!(room = %room, site = %site, "Created room");
            RoomState::new(site)
        } else {
            replay_state(replay.records)?
        };

        debug!(
            room = %room,
            db_version = state.db_version(),
            log_bytes = log.size(),
            "Opened room"
        );

        let (notify, _) = watch::channel(state.db_version());
        Ok(FileDatabase {
            room: room.clone(),
            site_id: state.site_id(),
            state: RwLock::new(state),
            log: Mutex::new(log),
            lock: Mutex::new(Some(lock)),
            notify,
            closed: AtomicBool::new(false),
        })
    }
}

/// Rebuilds room state from log records.
pub(crate) fn replay_state(records: Vec<LogRecord>) -> StoreResult<RoomState> {
    let mut records = records.into_iter();
    let mut state = match records.next() {
        Some(LogRecord::Site(site)) => RoomState::new(site),
        Some(other) => {
            return Err(StoreError::Corrupted(format!(
                "room log starts with {other:?} instead of a site record"
            )))
        }
        None => return Err(StoreError::Corrupted("room log is empty".into())),
    };

    for record in records {
        match record {
            LogRecord::Site(_) => {
                return Err(StoreError::Corrupted("duplicate site record".into()));
            }
            LogRecord::Schema(schema) => state.set_schema(schema),
            LogRecord::Apply { sender, changes } => {
                state.apply(sender, &changes);
            }
            LogRecord::Local {
                table,
                pk,
                cid,
                val,
            } => {
                state.write_local(&table, &pk, &cid, val);
            }
        }
    }
    Ok(state)
}

/// Handle to a room of a [`FileEngine`].
///
/// Writers hold the state lock while appending so the log order matches the
/// order mutations were applied in memory.
#[derive(Debug)]
pub struct FileDatabase {
    room: RoomId,
    site_id: SiteId,
    state: RwLock<RoomState>,
    log: Mutex<RoomLog>,
    lock: Mutex<Option<File>>,
    notify: watch::Sender<u64>,
    closed: AtomicBool,
}

impl FileDatabase {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn persist(&self, record: &LogRecord) -> StoreResult<()> {
        let mut log = self.log.lock();
        log.append(record)?;
        log.sync()
    }

    fn release_lock(&self) -> StoreResult<()> {
        if let Some(lock) = self.lock.lock().take() {
            lock.unlock()?;
        }
        Ok(())
    }
}

impl Database for FileDatabase {
    fn room(&self) -> &RoomId {
        &self.room
    }

    fn site_id(&self) -> SiteId {
        self.site_id
    }

    fn db_version(&self) -> StoreResult<u64> {
        self.check_open()?;
        Ok(self.state.read().db_version())
    }

    fn ensure_schema(&self, schema: &Schema) -> StoreResult<()> {
        self.check_open()?;
        let mut state = self.state.write();
        if state.check_schema(schema)? {
            self.persist(&LogRecord::Schema(schema.clone()))?;
            state.set_schema(schema.clone());
        }
        Ok(())
    }

    fn apply_changeset(
        &self,
        sender: SiteId,
        since: Watermark,
        changes: &[Change],
    ) -> StoreResult<ApplyOutcome> {
        self.check_open()?;
        let mut state = self.state.write();
        if let Err(reason) = state.validate(&sender, since, changes) {
            return Ok(ApplyOutcome::Rejected {
                reason,
                last_seen: state.last_seen(&sender),
            });
        }
        if changes.is_empty() {
            return Ok(ApplyOutcome::Accepted {
                last_seen: since,
                applied: 0,
            });
        }

        self.persist(&LogRecord::Apply {
            sender,
            changes: changes.to_vec(),
        })?;
        let applied = state.apply(sender, changes);
        let last_seen = state.last_seen(&sender);
        let version = state.db_version();
        drop(state);

        if applied > 0 {
            self.notify.send_replace(version);
        }
        Ok(ApplyOutcome::Accepted { last_seen, applied })
    }

    fn changes_since(
        &self,
        since: Watermark,
        exclude: &[SiteId],
        limit: usize,
    ) -> StoreResult<Vec<Change>> {
        self.check_open()?;
        Ok(self.state.read().changes_since(since, exclude, limit))
    }

    fn last_seen(&self, peer: &SiteId) -> StoreResult<Watermark> {
        self.check_open()?;
        Ok(self.state.read().last_seen(peer))
    }

    fn write_local(&self, table: &str, pk: &[u8], cid: &str, val: Value) -> StoreResult<Change> {
        self.check_open()?;
        let mut state = self.state.write();
        self.persist(&LogRecord::Local {
            table: table.to_string(),
            pk: pk.to_vec(),
            cid: cid.to_string(),
            val: val.clone(),
        })?;
        let change = state.write_local(table, pk, cid, val);
        drop(state);
        self.notify.send_replace(change.db_version);
        Ok(change)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let synced = self.log.lock().sync();
        let unlocked = self.release_lock();
        debug!(room = %self.room, "Closed room");
        synced.and(unlocked)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for FileDatabase {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.release_lock() {
                warn!(room = %self.room, error = %e, "Failed to release room lock");
            }
        }
    }
}
