//! In-memory storage engine for testing.

use crate::engine::{ApplyOutcome, Database, StorageEngine};
use crate::error::{StoreError, StoreResult};
use crate::state::RoomState;
use crsync_protocol::{Change, RoomId, Schema, SiteId, Value, Watermark};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Operation that can be made to fail on a [`MemoryEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// [`StorageEngine::open`] fails.
    Open,
    /// [`Database::apply_changeset`] fails.
    Apply,
    /// [`Database::close`] reports an error (the handle is still released).
    Close,
}

#[derive(Debug, Default)]
struct Shared {
    rooms: Mutex<HashMap<RoomId, Arc<RwLock<RoomState>>>>,
    live: Mutex<HashMap<RoomId, usize>>,
    faults: Mutex<HashSet<(RoomId, Fault)>>,
    close_delay: Mutex<Duration>,
    opens: AtomicUsize,
}

impl Shared {
    fn has_fault(&self, room: &RoomId, fault: Fault) -> bool {
        self.faults.lock().contains(&(room.clone(), fault))
    }

    fn release(&self, room: &RoomId) {
        let mut live = self.live.lock();
        if let Some(count) = live.get_mut(room) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                live.remove(room);
            }
        }
    }
}

fn injected(op: &str, room: &RoomId) -> StoreError {
    StoreError::Io(io::Error::other(format!("injected {op} failure for {room}")))
}

/// A storage engine that keeps every room in memory.
///
/// Room contents outlive their handles, so a room closed and reopened later
/// still holds its data. Like a file engine, only one handle per room may be
/// open at a time; a second open fails with [`StoreError::Locked`].
///
/// Clones share the same rooms.
///
/// # Example
///
/// ```rust
/// use crsync_store::{Database, MemoryEngine, StorageEngine};
/// use crsync_protocol::RoomId;
///
/// let engine = MemoryEngine::new();
/// let room = RoomId::new("notes").unwrap();
/// let db = engine.open(&room).unwrap();
/// assert_eq!(db.db_version().unwrap(), 0);
/// db.close().unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl MemoryEngine {
    /// Creates an engine with no rooms.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `fault` fail for `room` until cleared.
    pub fn inject_fault(&self, room: &RoomId, fault: Fault) {
        self.shared.faults.lock().insert((room.clone(), fault));
    }

    /// Clears a fault set by [`MemoryEngine::inject_fault`].
    pub fn clear_fault(&self, room: &RoomId, fault: Fault) {
        self.shared.faults.lock().remove(&(room.clone(), fault));
    }

    /// Makes every [`Database::close`] block for `delay` before it releases
    /// the room, like a slow sync to disk.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.shared.close_delay.lock() = delay;
    }

    /// Total number of successful opens.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Number of handles for `room` that are open right now.
    #[must_use]
    pub fn live_handles(&self, room: &RoomId) -> usize {
        self.shared.live.lock().get(room).copied().unwrap_or(0)
    }
}

impl StorageEngine for MemoryEngine {
    type Handle = MemoryDatabase;

    fn open(&self, room: &RoomId) -> StoreResult<MemoryDatabase> {
        if self.shared.has_fault(room, Fault::Open) {
            return Err(injected("open", room));
        }

        {
            let mut live = self.shared.live.lock();
            let count = live.entry(room.clone()).or_insert(0);
            if *count > 0 {
                return Err(StoreError::Locked(room.clone()));
            }
            *count += 1;
        }

        let state = self
            .shared
            .rooms
            .lock()
            .entry(room.clone())
            .or_insert_with(|| Arc::new(RwLock::new(RoomState::new(SiteId::random()))))
            .clone();
        self.shared.opens.fetch_add(1, Ordering::SeqCst);

        let (site_id, version) = {
            let state = state.read();
            (state.site_id(), state.db_version())
        };
        let (notify, _) = watch::channel(version);

        Ok(MemoryDatabase {
            room: room.clone(),
            site_id,
            state,
            notify,
            closed: AtomicBool::new(false),
            shared: Arc::clone(&self.shared),
        })
    }
}

/// Handle to a room of a [`MemoryEngine`].
#[derive(Debug)]
pub struct MemoryDatabase {
    room: RoomId,
    site_id: SiteId,
    state: Arc<RwLock<RoomState>>,
    notify: watch::Sender<u64>,
    closed: AtomicBool,
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl Database for MemoryDatabase {
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
        if self.shared.has_fault(&self.room, Fault::Apply) {
            return Err(injected("apply", &self.room));
        }

        let mut state = self.state.write();
        if let Err(reason) = state.validate(&sender, since, changes) {
            return Ok(ApplyOutcome::Rejected {
                reason,
                last_seen: state.last_seen(&sender),
            });
        }
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
        let change = self.state.write().write_local(table, pk, cid, val);
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
        let delay = *self.shared.close_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.shared.release(&self.room);
        if self.shared.has_fault(&self.room, Fault::Close) {
            return Err(injected("close", &self.room));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.release(&self.room);
        }
    }
}
