//! Per-connection protocol state machine.
//!
//! ```text
//! Uninitialized --AnnouncePresence--> Active --close--> Closed
//!       |                                                  ^
//!       +------------------- close / error ----------------+
//! ```
//!
//! Any error while handling a message closes the connection. Errors never
//! leave the connection: other connections and the shared room database are
//! unaffected.

use crate::cache::DbCache;
use crate::error::{ProtocolViolation, ServerResult};
use crate::session::SyncSession;
use crate::transport::Transport;
use crsync_protocol::{AnnouncePresence, Msg, MsgTag, RoomId};
use crsync_store::StorageEngine;
use std::fmt;
use tracing::{debug, info, warn};

/// Observable state of a [`ConnectionBroker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Waiting for `AnnouncePresence`.
    Uninitialized,
    /// Bound to a room with a running session.
    Active,
    /// Terminal.
    Closed,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerState::Uninitialized => write!(f, "uninitialized"),
            BrokerState::Active => write!(f, "active"),
            BrokerState::Closed => write!(f, "closed"),
        }
    }
}

enum ConnectionState<E: StorageEngine> {
    Uninitialized,
    Active(Box<SyncSession<E>>),
    Closed,
}

/// Routes one connection's messages to its sync session.
///
/// Messages are handled one at a time in the order they arrive.
pub struct ConnectionBroker<E: StorageEngine> {
    cache: DbCache<E>,
    transport: Transport,
    chunk_size: usize,
    state: ConnectionState<E>,
}

impl<E: StorageEngine> ConnectionBroker<E> {
    /// Creates a broker that answers through `transport`.
    ///
    /// `chunk_size` bounds the changes per outbound message.
    pub fn new(cache: DbCache<E>, transport: Transport, chunk_size: usize) -> Self {
        Self {
            cache,
            transport,
            chunk_size,
            state: ConnectionState::Uninitialized,
        }
    }

    /// Current state.
    pub fn state(&self) -> BrokerState {
        match self.state {
            ConnectionState::Uninitialized => BrokerState::Uninitialized,
            ConnectionState::Active(_) => BrokerState::Active,
            ConnectionState::Closed => BrokerState::Closed,
        }
    }

    /// Room the connection is bound to, once active.
    pub fn room(&self) -> Option<&RoomId> {
        match &self.state {
            ConnectionState::Active(session) => Some(session.room()),
            _ => None,
        }
    }

    /// Handles one inbound message.
    ///
    /// # Errors
    ///
    /// Any error is fatal: the broker is closed before it is returned.
    pub async fn handle_message(&mut self, msg: Msg) -> ServerResult<()> {
        let tag = msg.tag();
        let result = self.dispatch(msg).await;
        if let Err(e) = &result {
            if e.is_protocol_violation() {
                warn!(peer = %self.transport.peer(), tag = %tag, error = %e, "Protocol violation, closing connection");
            } else {
                warn!(peer = %self.transport.peer(), tag = %tag, error = %e, "Closing connection after error");
            }
            self.close();
        }
        result
    }

    async fn dispatch(&mut self, msg: Msg) -> ServerResult<()> {
        let tag = msg.tag();
        match msg {
            Msg::AnnouncePresence(announce) => {
                self.session_free(tag)?;
                self.announce(announce).await
            }
            Msg::Changes(changes) => {
                let session = self.session(tag)?;
                check_room(session.room(), &changes.room)?;
                session.receive_changes(changes).await
            }
            Msg::RejectChanges(notice) => {
                let session = self.session(tag)?;
                check_room(session.room(), &notice.room)?;
                session.changes_rejected(notice)
            }
            Msg::StartStreaming(_) => Err(ProtocolViolation::ServerBound { tag }.into()),
        }
    }

    fn session(&self, tag: MsgTag) -> ServerResult<&SyncSession<E>> {
        match &self.state {
            ConnectionState::Active(session) => Ok(session),
            ConnectionState::Uninitialized => Err(ProtocolViolation::NoSession { tag }.into()),
            ConnectionState::Closed => Err(ProtocolViolation::ConnectionClosed { tag }.into()),
        }
    }

    fn session_free(&self, tag: MsgTag) -> ServerResult<()> {
        match &self.state {
            ConnectionState::Uninitialized => Ok(()),
            ConnectionState::Active(session) => Err(ProtocolViolation::AlreadyAnnounced {
                room: session.room().clone(),
            }
            .into()),
            ConnectionState::Closed => Err(ProtocolViolation::ConnectionClosed { tag }.into()),
        }
    }

    async fn announce(&mut self, announce: AnnouncePresence) -> ServerResult<()> {
        let lease = self.cache.get(&announce.room).await?;
        let mut session =
            SyncSession::new(lease, self.transport.clone(), &announce, self.chunk_size);
        session.start(&announce).await?;

        info!(
            peer = %self.transport.peer(),
            room = %announce.room,
            site = %announce.sender,
            schema = %announce.schema,
            "Connection bound to room"
        );
        self.state = ConnectionState::Active(Box::new(session));
        Ok(())
    }

    /// Closes the session, if any, and the transport. Idempotent.
    pub fn close(&mut self) {
        let previous = std::mem::replace(&mut self.state, ConnectionState::Closed);
        match previous {
            ConnectionState::Active(mut session) => {
                session.close();
                debug!(peer = %self.transport.peer(), room = %session.room(), "Connection closed");
            }
            ConnectionState::Uninitialized => {
                debug!(peer = %self.transport.peer(), "Connection closed before announcing");
            }
            ConnectionState::Closed => {}
        }
        self.transport.close();
    }
}

impl<E: StorageEngine> Drop for ConnectionBroker<E> {
    fn drop(&mut self) {
        self.close();
    }
}

fn check_room(bound: &RoomId, received: &RoomId) -> ServerResult<()> {
    if bound != received {
        return Err(ProtocolViolation::RoomMismatch {
            bound: bound.clone(),
            received: received.clone(),
        }
        .into());
    }
    Ok(())
}
