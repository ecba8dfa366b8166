//! Main sync server.

use crate::broker::ConnectionBroker;
use crate::cache::DbCache;
use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::transport::Transport;
use crate::ws::serve_connection;
use crsync_store::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept, so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The sync server.
///
/// Owns the shared database cache and accepts WebSocket connections, giving
/// each its own [`ConnectionBroker`].
///
/// # Example
///
/// ```no_run
/// use crsync_server::{ServerConfig, SyncServer};
/// use crsync_store::MemoryEngine;
///
/// # async fn run() -> crsync_server::ServerResult<()> {
/// let server = SyncServer::new(ServerConfig::default(), MemoryEngine::new());
/// let listener = server.bind().await?;
/// server.serve(listener).await
/// # }
/// ```
pub struct SyncServer<E: StorageEngine> {
    config: ServerConfig,
    cache: DbCache<E>,
    shutdown: CancellationToken,
}

impl<E: StorageEngine> SyncServer<E> {
    /// Creates a server over `engine`.
    pub fn new(config: ServerConfig, engine: E) -> Self {
        Self::with_engine(config, Arc::new(engine))
    }

    /// Creates a server over a shared engine.
    pub fn with_engine(config: ServerConfig, engine: Arc<E>) -> Self {
        let cache = DbCache::new(engine, config.cache_ttl);
        Self {
            config,
            cache,
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the shared database cache.
    pub fn cache(&self) -> &DbCache<E> {
        &self.cache
    }

    /// Creates a broker for a connection whose socket is owned elsewhere.
    pub fn broker(&self, transport: Transport) -> ConnectionBroker<E> {
        ConnectionBroker::new(
            self.cache.clone(),
            transport,
            self.config.outbound_chunk_size,
        )
    }

    /// Token cancelled when shutdown starts.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts a graceful shutdown. [`SyncServer::serve`] stops accepting,
    /// drains connections and closes the cache before returning.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Returns true once shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Binds the configured address.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be bound.
    pub async fn bind(&self) -> ServerResult<TcpListener> {
        Ok(TcpListener::bind(self.config.bind_addr).await?)
    }

    /// Accepts connections on `listener` until shutdown.
    ///
    /// Connections over `max_connections` are refused. On shutdown every
    /// connection gets `shutdown_grace` to finish before it is aborted,
    /// then the cache is closed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the listener address cannot be read.
    pub async fn serve(&self, listener: TcpListener) -> ServerResult<()> {
        let addr = listener.local_addr()?;
        self.cache.start_eviction(self.config.eviction_interval);
        info!(addr = %addr, max_connections = self.config.max_connections, "Sync server listening");

        let limit = Arc::new(Semaphore::new(self.config.max_connections.max(1)));
        let mut connections = JoinSet::new();

        loop {
            while let Some(done) = connections.try_join_next() {
                log_join(done);
            }

            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let Ok(permit) = Arc::clone(&limit).try_acquire_owned() else {
                warn!(peer = %peer, "Connection limit reached, refusing");
                continue;
            };

            let cache = self.cache.clone();
            let config = self.config.clone();
            let token = self.shutdown.child_token();
            connections.spawn(async move {
                let _permit = permit;
                if let Err(e) = serve_connection(stream, peer.to_string(), cache, &config, token).await {
                    debug!(peer = %peer, error = %e, "Connection ended with error");
                }
            });
        }

        info!(connections = connections.len(), "Shutting down");
        let drain = async {
            while let Some(done) = connections.join_next().await {
                log_join(done);
            }
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            warn!(
                remaining = connections.len(),
                "Shutdown grace period elapsed, aborting connections"
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        self.cache.shutdown().await;
        info!("Sync server stopped");
        Ok(())
    }
}

fn log_join(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        if e.is_panic() {
            error!(error = %e, "Connection task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crsync_store::MemoryEngine;
    use crsync_testkit::fixtures::room;

    fn local_config() -> ServerConfig {
        ServerConfig::new("127.0.0.1:0".parse().unwrap())
            .with_shutdown_grace(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn serve_returns_after_shutdown() {
        let server = Arc::new(SyncServer::new(local_config(), MemoryEngine::new()));
        let listener = server.bind().await.unwrap();

        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!server.is_shutting_down());

        server.shutdown();
        assert!(server.is_shutting_down());
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(server.cache().is_shut_down());
    }

    #[tokio::test]
    async fn shutdown_closes_cached_rooms() {
        let engine = Arc::new(MemoryEngine::new());
        let server = SyncServer::with_engine(local_config(), Arc::clone(&engine));
        drop(server.cache().get(&room("r1")).await.unwrap());
        assert_eq!(engine.live_handles(&room("r1")), 1);

        let listener = server.bind().await.unwrap();
        server.shutdown();
        server.serve(listener).await.unwrap();
        assert_eq!(engine.live_handles(&room("r1")), 0);
    }

    #[tokio::test]
    async fn brokers_share_the_cache() {
        let server = SyncServer::new(local_config(), MemoryEngine::new());
        let (transport, _rx) = Transport::channel("local", 4);
        let broker = server.broker(transport);
        assert_eq!(broker.state(), crate::broker::BrokerState::Uninitialized);
        assert!(server.cache().is_empty());
        assert_eq!(server.config().outbound_chunk_size, 256);
    }
}
