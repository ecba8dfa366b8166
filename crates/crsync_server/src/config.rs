//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Default time a room stays cached after its last use.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How long an unused room stays open.
    pub cache_ttl: Duration,
    /// How often the cache looks for expired rooms.
    pub eviction_interval: Duration,
    /// Maximum changes per outbound `Changes` message.
    pub outbound_chunk_size: usize,
    /// Messages queued per connection before sends wait.
    pub outbound_queue_capacity: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_frame_bytes: usize,
    /// Time connections get to finish after shutdown starts.
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 1000,
            cache_ttl: DEFAULT_CACHE_TTL,
            eviction_interval: DEFAULT_CACHE_TTL,
            outbound_chunk_size: 256,
            outbound_queue_capacity: 16,
            max_frame_bytes: 16 * 1024 * 1024,
            shutdown_grace: Duration::from_secs(10),
        }
    }

    /// Sets the maximum concurrent connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the cache TTL and makes the sweep run at the same period.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self.eviction_interval = ttl;
        self
    }

    /// Sets the cache TTL in whole seconds, sweeping at the same period.
    pub fn with_cache_ttl_secs(self, secs: u64) -> Self {
        self.with_cache_ttl(Duration::from_secs(secs))
    }

    /// Sets the eviction sweep period independently of the TTL.
    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    /// Sets the maximum changes per outbound message.
    pub fn with_outbound_chunk_size(mut self, size: usize) -> Self {
        self.outbound_chunk_size = size.max(1);
        self
    }

    /// Sets the per-connection outbound queue capacity.
    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity.max(1);
        self
    }

    /// Sets the largest accepted inbound frame.
    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}
