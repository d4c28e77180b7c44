//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! TcpListener ── accept ──► connection task (one per socket)
//!                               │  upgrade + room id (gateway)
//!                               ▼
//!                          RoomRegistry ── room id ──► Room
//!                                                       ├── DocumentState
//!                                                       ├── AwarenessTable
//!                                                       └── BroadcastGroup ──► all connection tasks
//! ```
//!
//! Nothing is persisted: a room lives exactly as long as it has clients.

use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::connection::{self, ConnectionContext};
use crate::document::{DocumentState, YrsDocument};
use crate::registry::RoomRegistry;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind to
    pub host: String,
    /// TCP port to listen on
    pub port: u16,
    /// Maximum concurrently open rooms
    pub max_rooms: usize,
    /// Maximum clients per room
    pub max_clients_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Interval between keep-alive probes
    pub keepalive_interval: Duration,
    /// Time a new socket gets to complete the WebSocket upgrade
    pub handshake_timeout: Duration,
    /// Largest accepted WebSocket message
    pub max_message_size: usize,
    /// Longest accepted room id, in bytes
    pub max_room_id_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1234,
            max_rooms: 10_000,
            max_clients_per_room: 100,
            broadcast_capacity: 256,
            keepalive_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_message_size: 16 << 20,
            max_room_id_len: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
}

impl ServerConfig {
    /// Defaults overlaid with `HOST`, `PORT` and `TANDEM_*` environment
    /// variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`ServerConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(host) = lookup("HOST").filter(|h| !h.is_empty()) {
            config.host = host;
        }
        if let Some(port) = parse_var(&lookup, "PORT")? {
            config.port = port;
        }
        if let Some(max_rooms) = parse_var(&lookup, "TANDEM_MAX_ROOMS")? {
            config.max_rooms = max_rooms;
        }
        if let Some(max_clients) = parse_var(&lookup, "TANDEM_MAX_CLIENTS_PER_ROOM")? {
            config.max_clients_per_room = max_clients;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TANDEM_KEEPALIVE_SECS")? {
            config.keepalive_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TANDEM_HANDSHAKE_TIMEOUT_SECS")? {
            config.handshake_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(bytes) = parse_var(&lookup, "TANDEM_MAX_MESSAGE_BYTES")? {
            config.max_message_size = bytes;
        }

        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Server statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// Lock-free counters updated by connection tasks.
#[derive(Debug, Default)]
pub(crate) struct AtomicServerStats {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub rejected_connections: AtomicU64,
    pub total_messages: AtomicU64,
    pub total_bytes: AtomicU64,
}

impl AtomicServerStats {
    pub fn record_message(&self, bytes: usize) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }
}

/// The sync server.
pub struct SyncServer<D: DocumentState = YrsDocument> {
    config: Arc<ServerConfig>,
    registry: Arc<RoomRegistry<D>>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer<YrsDocument> {
    /// Server with default configuration and Yjs documents.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl<D: DocumentState> SyncServer<D> {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(
            config.max_rooms,
            config.max_clients_per_room,
            config.broadcast_capacity,
        ));
        Self {
            config: Arc::new(config),
            registry,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind the configured address. Failure here is fatal at startup.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.bind_addr();
        TcpListener::bind(addr.as_str())
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })
    }

    /// Bind and serve until the process is killed.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind and serve until `signal` resolves, then close every connection.
    pub async fn run_until(&self, signal: impl Future<Output = ()>) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener, signal).await
    }

    /// Accept connections on `listener` until `signal` resolves.
    ///
    /// On shutdown every connection is sent a close frame and runs its normal
    /// disconnect path; this returns once all of them have finished.
    pub async fn serve(
        &self,
        listener: TcpListener,
        signal: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        log::info!("Sync server listening on ws://{local_addr}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    log::info!("Shutdown requested, closing {} connections", connections.len());
                    break;
                }

                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            // Typically fd exhaustion; existing connections keep running
                            log::warn!("Failed to accept connection: {e}");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let ctx = ConnectionContext {
                        registry: self.registry.clone(),
                        stats: self.stats.clone(),
                        config: self.config.clone(),
                        shutdown: shutdown_rx.clone(),
                    };
                    connections.spawn(async move {
                        if let Err(e) = connection::handle_connection(stream, addr, ctx).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }

                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        log::error!("Connection task failed: {e}");
                    }
                }
            }
        }

        let _ = shutdown_tx.send(true);
        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                log::error!("Connection task failed during shutdown: {e}");
            }
        }
        log::info!("Sync server on {local_addr} stopped");
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count().await,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry<D>> {
        &self.registry
    }
}
