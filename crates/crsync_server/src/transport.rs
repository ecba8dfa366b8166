//! Outbound side of a peer connection.
//!
//! A [`Transport`] is the sending half the broker and session see. It
//! queues messages on a bounded channel drained by whatever owns the socket
//! (the WebSocket writer task, or a test). A full queue makes
//! [`Transport::send`] wait, which is how a slow peer slows its outbound
//! stream down.
//!
//! Delivery is ordered and at most once; nothing is retried.

use crate::error::{ServerError, ServerResult};
use crsync_protocol::Msg;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Sending half of a peer connection.
#[derive(Debug, Clone)]
pub struct Transport {
    peer: String,
    tx: mpsc::Sender<Msg>,
    closed: CancellationToken,
}

impl Transport {
    /// Creates a transport and the receiver that drains it.
    ///
    /// `peer` labels log lines. `capacity` bounds the queue.
    pub fn channel(peer: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Msg>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let transport = Self {
            peer: peer.into(),
            tx,
            closed: CancellationToken::new(),
        };
        (transport, rx)
    }

    /// Peer label.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queues a message, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::TransportClosed`] if the transport is closed
    /// before or while waiting, or the receiver is gone.
    pub async fn send(&self, msg: Msg) -> ServerResult<()> {
        if self.closed.is_cancelled() {
            return Err(ServerError::TransportClosed);
        }
        let tag = msg.tag();
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ServerError::TransportClosed),
            sent = self.tx.send(msg) => {
                sent.map_err(|_| ServerError::TransportClosed)?;
                trace!(peer = %self.peer, tag = %tag, "Queued message");
                Ok(())
            }
        }
    }

    /// Closes the transport. Idempotent.
    ///
    /// Pending and future sends fail; the socket owner sees
    /// [`Transport::closed`] resolve.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Returns true once the transport is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the transport is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}
