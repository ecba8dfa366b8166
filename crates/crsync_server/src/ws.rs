//! WebSocket adapter.
//!
//! Each protocol message travels in its own binary frame. The socket is
//! split: a writer task drains the connection's [`Transport`] queue into the
//! sink while the reader loop decodes frames and feeds the broker. Ping and
//! pong are answered by the WebSocket library.

use crate::broker::{BrokerState, ConnectionBroker};
use crate::cache::DbCache;
use crate::config::ServerConfig;
use crate::error::{ProtocolViolation, ServerError, ServerResult};
use crate::transport::Transport;
use crsync_protocol::Msg;
use crsync_store::StorageEngine;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::error::CapacityError;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Serves one client connection until it closes, breaks the protocol, or
/// `shutdown` fires.
///
/// The connection's session is closed and its room released before this
/// returns; the room stays cached.
///
/// # Errors
///
/// Returns the error that ended the connection. Clean closes and shutdown
/// return `Ok`.
#[instrument(skip_all, fields(peer = %peer))]
pub async fn serve_connection<S, E>(
    stream: S,
    peer: String,
    cache: DbCache<E>,
    config: &ServerConfig,
    shutdown: CancellationToken,
) -> ServerResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: StorageEngine,
{
    // Oversized frames are refused while they are read, before buffering.
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(config.max_frame_bytes))
        .max_frame_size(Some(config.max_frame_bytes));
    let ws = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;
    info!("Client connected");

    let (sink, mut source) = ws.split();
    let (transport, outbound) = Transport::channel(peer.clone(), config.outbound_queue_capacity);
    let writer = tokio::spawn(write_frames(sink, outbound, transport.clone()));
    let mut broker = ConnectionBroker::new(cache, transport.clone(), config.outbound_chunk_size);

    let result = loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            _ = transport.closed() => break Ok(()),
            frame = source.next() => frame,
        };

        let data = match frame {
            None | Some(Ok(Message::Close(_))) => break Ok(()),
            Some(Err(WsError::Capacity(CapacityError::MessageTooLong { size, max_size }))) => {
                break Err(ProtocolViolation::FrameTooLarge {
                    size,
                    max: max_size,
                }
                .into());
            }
            Some(Err(e)) => break Err(ServerError::from(e)),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Text(_))) => {
                break Err(ProtocolViolation::UnexpectedFrame("text frame".into()).into());
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
        };

        if data.len() > config.max_frame_bytes {
            break Err(ProtocolViolation::FrameTooLarge {
                size: data.len(),
                max: config.max_frame_bytes,
            }
            .into());
        }
        let msg = match Msg::decode(&data) {
            Ok(msg) => msg,
            Err(e) => break Err(e.into()),
        };
        if let Err(e) = broker.handle_message(msg).await {
            break Err(e);
        }
    };

    if let Err(e) = &result {
        // Broker errors were logged when the broker closed itself.
        if broker.state() != BrokerState::Closed {
            warn!(error = %e, "Dropping connection");
        }
    }
    broker.close();
    drop(broker);

    if let Err(e) = writer.await {
        warn!(error = %e, "Writer task failed");
    }
    info!("Client disconnected");
    result
}

async fn write_frames<K>(mut sink: K, mut outbound: mpsc::Receiver<Msg>, transport: Transport)
where
    K: futures::Sink<Message> + Unpin,
    K::Error: std::fmt::Display,
{
    loop {
        let msg = tokio::select! {
            biased;
            msg = outbound.recv() => msg,
            _ = transport.closed() => None,
        };
        let Some(msg) = msg else { break };

        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(tag = %msg.tag(), error = %e, "Failed to encode message");
                break;
            }
        };
        if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
            debug!(error = %e, "Send failed, closing connection");
            break;
        }
    }

    transport.close();
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Close handshake failed");
    }
}
