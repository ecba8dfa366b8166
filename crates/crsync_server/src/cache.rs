//! Shared room database cache.
//!
//! Every connection bound to a room goes through one [`DbCache`], so all of
//! them share a single open handle per room. Handles stay open while leased
//! and for `ttl` after their last lease drops; a periodic sweep closes the
//! rest.
//!
//! # Invariants
//!
//! - At most one open handle per room. A closing handle is taken out of the
//!   entry map and closed outside its lock; a new open for the room waits
//!   until that close has finished.
//! - A leased entry is never evicted. A storage call holds a lease until it
//!   returns, even if the caller stopped waiting for it.
//! - Concurrent first [`DbCache::get`] calls for a room open it once.

use crate::error::{ServerError, ServerResult};
use crsync_protocol::RoomId;
use crsync_store::{Database, StorageEngine, StoreResult};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type HandleCell<H> = Arc<OnceCell<Arc<H>>>;

struct CacheEntry<H> {
    cell: HandleCell<H>,
    last_access: Instant,
    leases: usize,
}

/// An entry taken out of the map whose handle may still need closing.
struct Detached<H> {
    room: RoomId,
    entry: CacheEntry<H>,
    opened: bool,
}

struct Sweeper {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct CacheInner<E: StorageEngine> {
    engine: Arc<E>,
    ttl: Duration,
    entries: Mutex<HashMap<RoomId, CacheEntry<E::Handle>>>,
    // Rooms whose handle was detached but is not closed yet.
    closing: Mutex<HashSet<RoomId>>,
    close_done: Condvar,
    closed: AtomicBool,
    sweeper: Mutex<Option<Sweeper>>,
}

/// Cache of open room databases with TTL eviction.
///
/// Cheap to clone; clones share the same entries.
pub struct DbCache<E: StorageEngine> {
    inner: Arc<CacheInner<E>>,
}

impl<E: StorageEngine> Clone for DbCache<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: StorageEngine> fmt::Debug for DbCache<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCache")
            .field("ttl", &self.inner.ttl)
            .field("entries", &self.len())
            .field("closed", &self.is_shut_down())
            .finish()
    }
}

impl<E: StorageEngine> DbCache<E> {
    /// Creates a cache that opens rooms through `engine`.
    ///
    /// Eviction does not run until [`DbCache::start_eviction`] is called.
    pub fn new(engine: Arc<E>, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                engine,
                ttl,
                entries: Mutex::new(HashMap::new()),
                closing: Mutex::new(HashSet::new()),
                close_done: Condvar::new(),
                closed: AtomicBool::new(false),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Time an unleased room stays open.
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Storage engine backing the cache.
    pub fn engine(&self) -> &Arc<E> {
        &self.inner.engine
    }

    /// Number of cached rooms, including rooms still opening.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Returns true if no room is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `room` is cached.
    pub fn contains(&self, room: &RoomId) -> bool {
        self.inner.entries.lock().contains_key(room)
    }

    /// Returns true once [`DbCache::shutdown`] has started.
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Leases the database for `room`, opening it if it is not cached.
    ///
    /// Refreshes the room's last-access time. Opening runs on the blocking
    /// pool. If the returned future is dropped before it completes, its
    /// claim on the entry is released.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::ShuttingDown`] after shutdown, or the engine's
    /// error if the room cannot be opened.
    pub async fn get(&self, room: &RoomId) -> ServerResult<DbLease<E>> {
        let reservation = self.inner.reserve(room)?;
        let inner = Arc::clone(&self.inner);
        let owned_room = room.clone();
        let handle = reservation
            .cell
            .get_or_try_init(|| async move {
                let opened = tokio::task::spawn_blocking(move || {
                    inner.wait_for_close(&owned_room);
                    let handle = inner.engine.open(&owned_room)?;
                    debug!(room = %owned_room, site = %handle.site_id(), "Opened room database");
                    Ok::<_, ServerError>(handle)
                })
                .await
                .map_err(|e| ServerError::Internal(format!("open task failed: {e}")))??;
                Ok::<_, ServerError>(Arc::new(opened))
            })
            .await?
            .clone();
        Ok(reservation.into_lease(handle))
    }

    /// Closes and removes every unleased room idle for longer than the TTL
    /// as of `now`. Returns the number of rooms evicted.
    ///
    /// Close failures are logged and do not stop the sweep. Blocks on
    /// storage I/O.
    pub fn evict_expired(&self, now: Instant) -> usize {
        self.inner.evict_expired(now)
    }

    /// Starts the periodic eviction sweep. Does nothing if it is already
    /// running or the cache is shut down.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_eviction(&self, interval: Duration) {
        if self.is_shut_down() {
            return;
        }
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = Arc::downgrade(&self.inner);
        let period = interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the immediate first tick
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !sweep(&weak).await {
                            break;
                        }
                    }
                }
            }
        });

        debug!(interval_ms = period.as_millis() as u64, "Started eviction sweep");
        *sweeper = Some(Sweeper { cancel, task });
    }

    /// Stops the sweep and closes every cached room.
    ///
    /// Unleased rooms close now; leased rooms close when their last lease
    /// drops. Close failures are logged and skipped. Later calls to
    /// [`DbCache::get`] fail with [`ServerError::ShuttingDown`].
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let sweeper = self.inner.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.cancel.cancel();
            if let Err(e) = sweeper.task.await {
                warn!(error = %e, "Eviction sweep ended abnormally");
            }
        }

        let inner = Arc::clone(&self.inner);
        match tokio::task::spawn_blocking(move || inner.close_idle()).await {
            Ok((closed, deferred)) => {
                info!(closed, deferred, "Database cache shut down");
            }
            Err(e) => error!(error = %e, "Closing cached rooms failed"),
        }
    }
}

/// Runs one sweep. Returns false once the cache is gone.
async fn sweep<E: StorageEngine>(weak: &Weak<CacheInner<E>>) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    let now = Instant::now();
    match tokio::task::spawn_blocking(move || inner.evict_expired(now)).await {
        Ok(0) => {}
        Ok(evicted) => debug!(evicted, "Evicted idle rooms"),
        Err(e) => warn!(error = %e, "Eviction sweep failed"),
    }
    true
}

impl<E: StorageEngine> CacheInner<E> {
    fn reserve(self: &Arc<Self>, room: &RoomId) -> ServerResult<Reservation<E>> {
        let mut entries = self.entries.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(ServerError::ShuttingDown);
        }
        let now = Instant::now();
        let entry = entries.entry(room.clone()).or_insert_with(|| CacheEntry {
            cell: Arc::new(OnceCell::new()),
            last_access: now,
            leases: 0,
        });
        entry.leases += 1;
        entry.last_access = now;
        Ok(Reservation {
            inner: Arc::clone(self),
            room: room.clone(),
            cell: Arc::clone(&entry.cell),
            armed: true,
        })
    }

    fn acquire(&self, room: &RoomId, cell: &HandleCell<E::Handle>) {
        let mut entries = self.entries.lock();
        match entries.get_mut(room) {
            Some(entry) if Arc::ptr_eq(&entry.cell, cell) => entry.leases += 1,
            _ => error!(room = %room, "Cloned a lease whose cache entry is gone"),
        }
    }

    fn release(&self, room: &RoomId, cell: &HandleCell<E::Handle>) {
        let detached = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(room) else {
                return;
            };
            if !Arc::ptr_eq(&entry.cell, cell) {
                return;
            }
            entry.leases = entry.leases.saturating_sub(1);
            entry.last_access = Instant::now();
            if entry.leases > 0 {
                return;
            }

            // A failed open leaves an empty cell behind; after shutdown
            // nothing stays cached.
            if !self.closed.load(Ordering::SeqCst) && entry.cell.initialized() {
                return;
            }
            self.detach(&mut entries, room)
        };
        if let Some(detached) = detached {
            self.finish_close(detached);
        }
    }

    fn evict_expired(&self, now: Instant) -> usize {
        let detached: Vec<_> = {
            let mut entries = self.entries.lock();
            let expired: Vec<RoomId> = entries
                .iter()
                .filter(|(_, e)| {
                    e.leases == 0 && now.saturating_duration_since(e.last_access) > self.ttl
                })
                .map(|(room, _)| room.clone())
                .collect();
            expired
                .iter()
                .filter_map(|room| self.detach(&mut entries, room))
                .collect()
        };

        let evicted = detached.len();
        for d in detached {
            debug!(room = %d.room, "Evicting idle room");
            self.finish_close(d);
        }
        evicted
    }

    fn close_idle(&self) -> (usize, usize) {
        let (detached, deferred) = {
            let mut entries = self.entries.lock();
            let idle: Vec<RoomId> = entries
                .iter()
                .filter(|(_, e)| e.leases == 0)
                .map(|(room, _)| room.clone())
                .collect();
            let detached: Vec<_> = idle
                .iter()
                .filter_map(|room| self.detach(&mut entries, room))
                .collect();
            (detached, entries.len())
        };

        let closed = detached.len();
        for d in detached {
            self.finish_close(d);
        }
        (closed, deferred)
    }

    /// Removes `room` from the map. Must be called with `entries` locked so
    /// that no new open for the room can slip in before it is marked closing.
    fn detach(
        &self,
        entries: &mut HashMap<RoomId, CacheEntry<E::Handle>>,
        room: &RoomId,
    ) -> Option<Detached<E::Handle>> {
        let entry = entries.remove(room)?;
        let opened = entry.cell.initialized();
        if opened {
            self.closing.lock().insert(room.clone());
        }
        Some(Detached {
            room: room.clone(),
            entry,
            opened,
        })
    }

    /// Closes a detached handle and wakes opens waiting on it. Blocks on
    /// storage I/O; never called with `entries` locked.
    fn finish_close(&self, detached: Detached<E::Handle>) {
        if !detached.opened {
            return;
        }
        close_entry(&detached.room, &detached.entry);
        self.closing.lock().remove(&detached.room);
        self.close_done.notify_all();
    }

    fn wait_for_close(&self, room: &RoomId) {
        let mut closing = self.closing.lock();
        while closing.contains(room) {
            self.close_done.wait(&mut closing);
        }
    }
}

fn close_entry<H: Database>(room: &RoomId, entry: &CacheEntry<H>) {
    if let Some(handle) = entry.cell.get() {
        match handle.close() {
            Ok(()) => debug!(room = %room, "Closed room database"),
            Err(e) => warn!(room = %room, error = %e, "Failed to close room database"),
        }
    }
}

/// Claim on an entry while its handle is being opened.
struct Reservation<E: StorageEngine> {
    inner: Arc<CacheInner<E>>,
    room: RoomId,
    cell: HandleCell<E::Handle>,
    armed: bool,
}

impl<E: StorageEngine> Reservation<E> {
    fn into_lease(mut self, handle: Arc<E::Handle>) -> DbLease<E> {
        self.armed = false;
        DbLease {
            inner: Arc::clone(&self.inner),
            room: self.room.clone(),
            cell: Arc::clone(&self.cell),
            handle,
        }
    }
}

impl<E: StorageEngine> Drop for Reservation<E> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release(&self.room, &self.cell);
        }
    }
}

/// A leased room database.
///
/// While any lease for a room exists the cache will not evict or close it.
/// Dropping the last lease refreshes the room's last-access time.
pub struct DbLease<E: StorageEngine> {
    inner: Arc<CacheInner<E>>,
    room: RoomId,
    cell: HandleCell<E::Handle>,
    handle: Arc<E::Handle>,
}

impl<E: StorageEngine> DbLease<E> {
    /// Room this lease belongs to.
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Shared handle behind the lease.
    pub fn handle(&self) -> &Arc<E::Handle> {
        &self.handle
    }

    /// Runs a blocking storage call on the blocking pool.
    ///
    /// The call holds its own lease until it returns, so the room stays open
    /// even if this future is dropped first.
    ///
    /// A [`crsync_store::StoreError::Closed`] from a leased handle means the
    /// cache broke its own invariant and is logged as such.
    pub async fn run_blocking<F, T>(&self, f: F) -> ServerResult<T>
    where
        F: FnOnce(&E::Handle) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let lease = self.clone();
        let result = tokio::task::spawn_blocking(move || f(&lease.handle))
            .await
            .map_err(|e| ServerError::Internal(format!("storage task failed: {e}")))?;
        result.map_err(|e| {
            if e.is_closed() {
                error!(room = %self.room, "Leased room database was closed underneath a session");
            }
            ServerError::Store(e)
        })
    }
}

impl<E: StorageEngine> Clone for DbLease<E> {
    fn clone(&self) -> Self {
        self.inner.acquire(&self.room, &self.cell);
        Self {
            inner: Arc::clone(&self.inner),
            room: self.room.clone(),
            cell: Arc::clone(&self.cell),
            handle: Arc::clone(&self.handle),
        }
    }
}

impl<E: StorageEngine> Drop for DbLease<E> {
    fn drop(&mut self) {
        self.inner.release(&self.room, &self.cell);
    }
}

impl<E: StorageEngine> Deref for DbLease<E> {
    type Target = E::Handle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<E: StorageEngine> fmt::Debug for DbLease<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbLease").field("room", &self.room).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crsync_store::{Fault, MemoryEngine};

    const TTL: Duration = Duration::from_secs(5);

    fn room(name: &str) -> RoomId {
        RoomId::new(name).unwrap()
    }

    fn cache() -> (Arc<MemoryEngine>, DbCache<MemoryEngine>) {
        let engine = Arc::new(MemoryEngine::new());
        let cache = DbCache::new(Arc::clone(&engine), TTL);
        (engine, cache)
    }

    #[tokio::test]
    async fn get_twice_shares_handle() {
        let (engine, cache) = cache();
        let r1 = room("r1");
        let a = cache.get(&r1).await.unwrap();
        let b = cache.get(&r1).await.unwrap();
        assert!(Arc::ptr_eq(a.handle(), b.handle()));
        assert_eq!(engine.open_count(), 1);
        assert_eq!(engine.live_handles(&r1), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_gets_open_once() {
        let (engine, cache) = cache();
        let r1 = room("r1");
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let r1 = r1.clone();
            tasks.push(tokio::spawn(async move { cache.get(&r1).await.map(|l| l.site_id()) }));
        }
        let mut sites = Vec::new();
        for task in tasks {
            sites.push(task.await.unwrap().unwrap());
        }
        assert!(sites.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(engine.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_closes_and_reopens() {
        let (engine, cache) = cache();
        let r1 = room("r1");
        let t0 = Instant::now();
        let first = cache.get(&r1).await.unwrap();
        let first_handle = Arc::clone(first.handle());
        drop(first);

        // Within the TTL nothing happens.
        assert_eq!(cache.evict_expired(t0 + Duration::from_secs(4)), 0);
        assert!(cache.contains(&r1));

        assert_eq!(cache.evict_expired(t0 + Duration::from_secs(6)), 1);
        assert!(!cache.contains(&r1));
        assert!(first_handle.is_closed());
        assert_eq!(engine.live_handles(&r1), 0);

        tokio::time::advance(Duration::from_secs(7)).await;
        let second = cache.get(&r1).await.unwrap();
        assert!(!Arc::ptr_eq(&first_handle, second.handle()));
        assert_eq!(engine.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn get_refreshes_last_access() {
        let (_engine, cache) = cache();
        let r1 = room("r1");
        drop(cache.get(&r1).await.unwrap());

        tokio::time::advance(Duration::from_secs(4)).await;
        drop(cache.get(&r1).await.unwrap());

        // 8s after the first access, 4s after the second.
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cache.evict_expired(Instant::now()), 0);
        assert!(cache.contains(&r1));
    }

    #[tokio::test(start_paused = true)]
    async fn leased_entry_never_evicted() {
        let (engine, cache) = cache();
        let r1 = room("r1");
        let lease = cache.get(&r1).await.unwrap();

        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(cache.evict_expired(later), 0);
        assert!(!lease.is_closed());

        let clone = lease.clone();
        drop(lease);
        assert_eq!(cache.evict_expired(later), 0);
        drop(clone);
        assert_eq!(cache.evict_expired(Instant::now() + TTL * 2), 1);
        assert_eq!(engine.live_handles(&r1), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_on_schedule() {
        let (engine, cache) = cache();
        let r1 = room("r1");
        cache.start_eviction(TTL);
        drop(cache.get(&r1).await.unwrap());

        // Ticks at 5s (not yet expired) and 10s (expired).
        tokio::time::sleep(Duration::from_secs(11)).await;
        for _ in 0..10 {
            if !cache.contains(&r1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!cache.contains(&r1));
        assert_eq!(engine.live_handles(&r1), 0);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn failed_open_leaves_no_entry() {
        let (engine, cache) = cache();
        let r1 = room("r1");
        engine.inject_fault(&r1, Fault::Open);
        let err = cache.get(&r1).await.unwrap_err();
        assert!(err.is_storage_failure());
        assert!(!cache.contains(&r1));

        engine.clear_fault(&r1, Fault::Open);
        assert!(cache.get(&r1).await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_closes_all_despite_failures() {
        let (engine, cache) = cache();
        let rooms: Vec<_> = ["a", "b", "c"].iter().map(|n| room(n)).collect();
        for r in &rooms {
            drop(cache.get(r).await.unwrap());
        }
        engine.inject_fault(&rooms[1], Fault::Close);

        cache.shutdown().await;
        assert!(cache.is_empty());
        for r in &rooms {
            assert_eq!(engine.live_handles(r), 0);
        }
        assert!(matches!(
            cache.get(&rooms[0]).await,
            Err(ServerError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn shutdown_defers_leased_rooms() {
        let (engine, cache) = cache();
        let r1 = room("r1");
        let lease = cache.get(&r1).await.unwrap();

        cache.shutdown().await;
        assert!(!lease.is_closed());
        assert!(cache.contains(&r1));

        let handle = Arc::clone(lease.handle());
        drop(lease);
        assert!(handle.is_closed());
        assert!(!cache.contains(&r1));
        assert_eq!(engine.live_handles(&r1), 0);
    }

    #[tokio::test]
    async fn run_blocking_reports_store_errors() {
        let (_engine, cache) = cache();
        let lease = cache.get(&room("r1")).await.unwrap();
        let version = lease.run_blocking(|db| db.db_version()).await.unwrap();
        assert_eq!(version, 0);

        lease.handle().close().unwrap();
        let err = lease.run_blocking(|db| db.db_version()).await.unwrap_err();
        assert!(err.is_storage_failure());
    }

    #[tokio::test]
    async fn cancelled_call_keeps_room_open_until_it_returns() {
        let (engine, cache) = cache();
        let r1 = room("r1");
        let lease = cache.get(&r1).await.unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let call = lease.run_blocking(move |db| {
            std::thread::sleep(Duration::from_millis(300));
            let _ = tx.send(db.is_closed());
            Ok(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(50), call)
            .await
            .is_err());
        drop(lease);

        // The storage call still holds the room.
        assert_eq!(cache.evict_expired(Instant::now() + TTL * 2), 0);
        cache.shutdown().await;
        assert!(cache.contains(&r1));

        let closed_during_call = tokio::task::spawn_blocking(move || rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!closed_during_call);

        for _ in 0..50 {
            if !cache.contains(&r1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!cache.contains(&r1));
        assert_eq!(engine.live_handles(&r1), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_close_does_not_stall_other_rooms() {
        let (engine, cache) = cache();
        let (r1, r2) = (room("r1"), room("r2"));
        let first = Arc::clone(cache.get(&r1).await.unwrap().handle());
        engine.set_close_delay(Duration::from_millis(300));

        let sweep = {
            let cache = cache.clone();
            tokio::task::spawn_blocking(move || cache.evict_expired(Instant::now() + TTL * 2))
        };
        for _ in 0..100 {
            if !cache.contains(&r1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!cache.contains(&r1));

        let other = tokio::time::timeout(Duration::from_millis(100), cache.get(&r2))
            .await
            .expect("get blocked behind another room's close")
            .unwrap();
        drop(other);

        // Reopening waits for the old handle instead of racing it.
        let reopened = cache.get(&r1).await.unwrap();
        assert!(first.is_closed());
        assert!(!reopened.is_closed());
        assert_eq!(engine.live_handles(&r1), 1);
        assert_eq!(sweep.await.unwrap(), 1);
    }
}
