//! Serve command implementation.
//!
//! Settings come from an optional JSON file; flags override it.

use clap::Args;
use crsync_server::{ServerConfig, SyncServer};
use crsync_store::{FileEngine, MemoryEngine, StorageEngine};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Flags of the serve command.
#[derive(Debug, Clone, Default, Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,

    /// Directory holding room logs
    #[arg(short, long, conflicts_with = "memory")]
    pub data_dir: Option<PathBuf>,

    /// Keep rooms in memory only
    #[arg(long)]
    pub memory: bool,

    /// Seconds an unused room stays open
    #[arg(long)]
    pub cache_ttl_secs: Option<u64>,

    /// Seconds between eviction sweeps (defaults to the TTL)
    #[arg(long)]
    pub eviction_interval_secs: Option<u64>,

    /// Maximum concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Contents of a JSON configuration file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Address to listen on.
    pub bind: Option<SocketAddr>,
    /// Directory holding room logs.
    pub data_dir: Option<PathBuf>,
    /// Keep rooms in memory only.
    pub memory: Option<bool>,
    /// Seconds an unused room stays open.
    pub cache_ttl_secs: Option<u64>,
    /// Seconds between eviction sweeps.
    pub eviction_interval_secs: Option<u64>,
    /// Maximum concurrent connections.
    pub max_connections: Option<usize>,
    /// Maximum changes per outbound message.
    pub outbound_chunk_size: Option<usize>,
    /// Outbound messages queued per connection.
    pub outbound_queue_capacity: Option<usize>,
    /// Largest inbound frame, in bytes.
    pub max_frame_bytes: Option<usize>,
    /// Seconds connections get to finish on shutdown.
    pub shutdown_grace_secs: Option<u64>,
}

impl FileConfig {
    /// Reads a configuration file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Cannot read config {:?}: {e}", path))?;
        let config = serde_json::from_str(&text)
            .map_err(|e| format!("Invalid config {:?}: {e}", path))?;
        Ok(config)
    }
}

/// Where rooms are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    /// In memory, lost on exit.
    Memory,
    /// Room logs under a directory.
    Dir(PathBuf),
}

/// Merges flags over file settings.
pub fn resolve(
    args: &ServeArgs,
    file: FileConfig,
) -> Result<(ServerConfig, Storage), Box<dyn std::error::Error>> {
    let storage = if args.memory {
        Storage::Memory
    } else if let Some(dir) = &args.data_dir {
        Storage::Dir(dir.clone())
    } else {
        match (file.data_dir, file.memory.unwrap_or(false)) {
            (Some(_), true) => return Err("Config sets both data_dir and memory".into()),
            (Some(dir), false) => Storage::Dir(dir),
            (None, true) => Storage::Memory,
            (None, false) => return Err("Either --data-dir or --memory is required".into()),
        }
    };

    let bind = args
        .bind
        .or(file.bind)
        .unwrap_or_else(|| ServerConfig::default().bind_addr);
    let mut config = ServerConfig::new(bind);

    if let Some(ttl) = args.cache_ttl_secs.or(file.cache_ttl_secs) {
        config = config.with_cache_ttl_secs(ttl);
    }
    if let Some(interval) = args.eviction_interval_secs.or(file.eviction_interval_secs) {
        config = config.with_eviction_interval(Duration::from_secs(interval));
    }
    if let Some(max) = args.max_connections.or(file.max_connections) {
        config = config.with_max_connections(max);
    }
    if let Some(size) = file.outbound_chunk_size {
        config = config.with_outbound_chunk_size(size);
    }
    if let Some(capacity) = file.outbound_queue_capacity {
        config = config.with_outbound_queue_capacity(capacity);
    }
    if let Some(bytes) = file.max_frame_bytes {
        config = config.with_max_frame_bytes(bytes);
    }
    if let Some(grace) = file.shutdown_grace_secs {
        config = config.with_shutdown_grace(Duration::from_secs(grace));
    }

    Ok((config, storage))
}

/// Runs the serve command until Ctrl-C.
pub fn run(args: &ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let (config, storage) = resolve(args, file)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match storage {
            Storage::Memory => {
                info!("Serving rooms from memory");
                serve(config, MemoryEngine::new()).await
            }
            Storage::Dir(dir) => {
                info!(dir = %dir.display(), "Serving rooms from disk");
                serve(config, FileEngine::open(&dir)?).await
            }
        }
    })
}

async fn serve<E: StorageEngine>(
    config: ServerConfig,
    engine: E,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = Arc::new(SyncServer::new(config, engine));
    let listener = server.bind().await?;

    let signal = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl-C, shutting down");
                    server.shutdown();
                }
                Err(e) => error!(error = %e, "Cannot listen for Ctrl-C"),
            }
        })
    };

    let result = server.serve(listener).await;
    signal.abort();
    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args() -> ServeArgs {
        ServeArgs {
            memory: true,
            ..ServeArgs::default()
        }
    }

    #[test]
    fn defaults() {
        let (config, storage) = resolve(&args(), FileConfig::default()).unwrap();
        assert_eq!(storage, Storage::Memory);
        assert_eq!(config.bind_addr, ServerConfig::default().bind_addr);
        assert_eq!(config.cache_ttl, crsync_server::DEFAULT_CACHE_TTL);
    }

    #[test]
    fn storage_is_required() {
        let err = resolve(&ServeArgs::default(), FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("--data-dir"));

        let file = FileConfig {
            data_dir: Some("rooms".into()),
            memory: Some(true),
            ..FileConfig::default()
        };
        assert!(resolve(&ServeArgs::default(), file).is_err());
    }

    #[test]
    fn ttl_sets_interval_unless_given() {
        let mut a = args();
        a.cache_ttl_secs = Some(30);
        let (config, _) = resolve(&a, FileConfig::default()).unwrap();
        assert_eq!(config.cache_ttl, Duration::from_secs(30));
        assert_eq!(config.eviction_interval, Duration::from_secs(30));

        a.eviction_interval_secs = Some(5);
        let (config, _) = resolve(&a, FileConfig::default()).unwrap();
        assert_eq!(config.cache_ttl, Duration::from_secs(30));
        assert_eq!(config.eviction_interval, Duration::from_secs(5));
    }

    #[test]
    fn flags_override_file() {
        let file = FileConfig {
            bind: Some("0.0.0.0:9000".parse().unwrap()),
            data_dir: Some("from-file".into()),
            cache_ttl_secs: Some(120),
            max_connections: Some(10),
            outbound_chunk_size: Some(64),
            ..FileConfig::default()
        };
        let flags = ServeArgs {
            data_dir: Some("from-flag".into()),
            max_connections: Some(20),
            ..ServeArgs::default()
        };

        let (config, storage) = resolve(&flags, file).unwrap();
        assert_eq!(storage, Storage::Dir("from-flag".into()));
        assert_eq!(config.bind_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.cache_ttl, Duration::from_secs(120));
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.outbound_chunk_size, 64);
    }

    #[test]
    fn load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "bind": "127.0.0.1:7000", "memory": true, "shutdown_grace_secs": 3 }}"#
        )
        .unwrap();

        let loaded = FileConfig::load(file.path()).unwrap();
        let (config, storage) = resolve(&ServeArgs::default(), loaded).unwrap();
        assert_eq!(storage, Storage::Memory);
        assert_eq!(config.bind_addr.port(), 7000);
        assert_eq!(config.shutdown_grace, Duration::from_secs(3));
    }

    #[test]
    fn unknown_config_keys_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "memroy": true }}"#).unwrap();
        assert!(FileConfig::load(file.path()).is_err());
    }
}
