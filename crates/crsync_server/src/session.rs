//! Per-connection sync session.
//!
//! A session pairs one peer with one leased room database. Inbound changesets
//! are applied in arrival order; a background task streams the room's
//! changes the peer has not seen, one chunk at a time, waiting for the
//! transport to accept each chunk before querying the next.

use crate::cache::DbLease;
use crate::error::{ProtocolViolation, ServerError, ServerResult};
use crate::transport::Transport;
use crsync_protocol::{
    AnnouncePresence, Change, Changes, Msg, RejectChanges, RoomId, SiteId, StartStreaming,
    Watermark,
};
use crsync_store::{ApplyOutcome, Database, StorageEngine};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sync session for one connection bound to one room.
pub struct SyncSession<E: StorageEngine> {
    room: RoomId,
    peer: SiteId,
    server_site: SiteId,
    lease: Option<DbLease<E>>,
    transport: Transport,
    chunk_size: usize,
    cancel: CancellationToken,
    resets: watch::Sender<Option<Watermark>>,
    outbound: Option<JoinHandle<()>>,
}

impl<E: StorageEngine> SyncSession<E> {
    /// Creates a session for the peer that sent `announce`.
    ///
    /// Nothing is sent until [`SyncSession::start`].
    pub fn new(
        lease: DbLease<E>,
        transport: Transport,
        announce: &AnnouncePresence,
        chunk_size: usize,
    ) -> Self {
        let (resets, _) = watch::channel(None);
        Self {
            room: announce.room.clone(),
            peer: announce.sender,
            server_site: lease.site_id(),
            lease: Some(lease),
            transport,
            chunk_size: chunk_size.max(1),
            cancel: CancellationToken::new(),
            resets,
            outbound: None,
        }
    }

    /// Room the session is bound to.
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Site id of the peer.
    pub fn peer(&self) -> SiteId {
        self.peer
    }

    /// Site id of the room database.
    pub fn server_site(&self) -> SiteId {
        self.server_site
    }

    /// Returns true until [`SyncSession::close`].
    pub fn is_active(&self) -> bool {
        self.lease.is_some()
    }

    fn lease(&self) -> ServerResult<&DbLease<E>> {
        self.lease
            .as_ref()
            .ok_or_else(|| ServerError::Internal("session is closed".into()))
    }

    /// Records the peer's schema, tells the peer where to start sending from,
    /// and starts streaming the room's changes to it.
    ///
    /// # Errors
    ///
    /// Any failure is fatal to this session.
    pub async fn start(&mut self, announce: &AnnouncePresence) -> ServerResult<()> {
        let lease = self.lease()?.clone();

        let schema = announce.schema.clone();
        lease.run_blocking(move |db| db.ensure_schema(&schema)).await?;

        let peer = self.peer;
        let since = lease.run_blocking(move |db| db.last_seen(&peer)).await?;
        self.transport
            .send(Msg::StartStreaming(StartStreaming {
                room: self.room.clone(),
                since,
                exclude_sites: vec![self.server_site],
                local_only: false,
            }))
            .await?;

        let from = announce.last_seen_for(&self.server_site);
        let stream = OutboundStream {
            lease,
            transport: self.transport.clone(),
            room: self.room.clone(),
            peer: self.peer,
            server_site: self.server_site,
            chunk_size: self.chunk_size,
            resets: self.resets.subscribe(),
            cancel: self.cancel.clone(),
        };
        self.outbound = Some(tokio::spawn(stream.run(from)));

        info!(
            room = %self.room,
            peer = %self.peer,
            peer_since = %since,
            stream_from = %from,
            "Sync session started"
        );
        Ok(())
    }

    /// Applies a changeset from the peer.
    ///
    /// A changeset the engine cannot merge is answered with `RejectChanges`
    /// carrying the watermark the room still holds for the peer; the session
    /// stays active.
    ///
    /// # Errors
    ///
    /// Returns a violation if the changeset names another sender, or the
    /// storage error if applying failed.
    pub async fn receive_changes(&self, msg: Changes) -> ServerResult<()> {
        if msg.sender != self.peer {
            return Err(ProtocolViolation::SiteMismatch {
                expected: self.peer,
                received: msg.sender,
            }
            .into());
        }

        let lease = self.lease()?;
        let Changes {
            sender,
            since,
            changes,
            ..
        } = msg;
        let count = changes.len();
        let outcome = lease
            .run_blocking(move |db| db.apply_changeset(sender, since, &changes))
            .await?;

        match outcome {
            ApplyOutcome::Accepted { last_seen, applied } => {
                debug!(
                    room = %self.room,
                    peer = %self.peer,
                    received = count,
                    applied,
                    last_seen = %last_seen,
                    "Applied changes"
                );
                Ok(())
            }
            ApplyOutcome::Rejected { reason, last_seen } => {
                info!(
                    room = %self.room,
                    peer = %self.peer,
                    since = %since,
                    last_seen = %last_seen,
                    reason = %reason,
                    "Rejected changes"
                );
                self.transport
                    .send(Msg::RejectChanges(RejectChanges {
                        room: self.room.clone(),
                        whose: sender,
                        since: last_seen,
                        reason: reason.to_string(),
                    }))
                    .await
            }
        }
    }

    /// Handles the peer rejecting changes the session sent.
    ///
    /// The outbound stream restarts from the peer's watermark and resends the
    /// room's current state after it.
    ///
    /// # Errors
    ///
    /// Returns a violation if the notice is about another site's changes.
    pub fn changes_rejected(&self, notice: RejectChanges) -> ServerResult<()> {
        if notice.whose != self.server_site {
            return Err(ProtocolViolation::SiteMismatch {
                expected: self.server_site,
                received: notice.whose,
            }
            .into());
        }
        self.lease()?;
        info!(
            room = %self.room,
            peer = %self.peer,
            since = %notice.since,
            reason = %notice.reason,
            "Peer rejected changes, restreaming"
        );
        self.resets.send_replace(Some(notice.since));
        Ok(())
    }

    /// Stops streaming and releases the room. Idempotent.
    ///
    /// The room database stays open in the cache.
    pub fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.outbound.take() {
            task.abort();
        }
        if self.lease.take().is_some() {
            debug!(room = %self.room, peer = %self.peer, "Sync session closed");
        }
    }
}

impl<E: StorageEngine> Drop for SyncSession<E> {
    fn drop(&mut self) {
        self.close();
    }
}

struct OutboundStream<E: StorageEngine> {
    lease: DbLease<E>,
    transport: Transport,
    room: RoomId,
    peer: SiteId,
    server_site: SiteId,
    chunk_size: usize,
    resets: watch::Receiver<Option<Watermark>>,
    cancel: CancellationToken,
}

impl<E: StorageEngine> OutboundStream<E> {
    async fn run(mut self, from: Watermark) {
        let mut since = from;
        let mut updates = self.lease.subscribe();

        loop {
            if self.resets.has_changed().unwrap_or(false) {
                self.take_reset(&mut since);
            }
            updates.borrow_and_update();

            let peer = self.peer;
            let limit = self.chunk_size;
            let batch = match self
                .lease
                .run_blocking(move |db| db.changes_since(since, &[peer], limit))
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(room = %self.room, peer = %self.peer, error = %e, "Outbound stream failed");
                    self.transport.close();
                    return;
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    changed = self.resets.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        self.take_reset(&mut since);
                    }
                }
                continue;
            }

            let until = batch.last().map_or(since, Change::watermark);
            let count = batch.len();
            let msg = Msg::Changes(Changes {
                room: self.room.clone(),
                sender: self.server_site,
                since,
                changes: batch,
            });
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                sent = self.transport.send(msg) => {
                    if sent.is_err() {
                        debug!(room = %self.room, peer = %self.peer, "Transport closed, stopping outbound stream");
                        return;
                    }
                }
            }
            debug!(
                room = %self.room,
                peer = %self.peer,
                since = %since,
                until = %until,
                count,
                "Sent changes"
            );
            since = until;
        }
    }

    fn take_reset(&mut self, since: &mut Watermark) {
        if let Some(watermark) = *self.resets.borrow_and_update() {
            *since = watermark;
        }
    }
}
