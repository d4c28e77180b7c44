//! A single collaboration room.
//!
//! ```text
//! Connection A ──┐                      ┌──► Connection A (skips own frames)
//!                ├──► Room::handle ─────┼──► Connection B
//! Connection B ──┘   (Mutex<RoomState>) └──► Connection C
//!                     document + awareness   BroadcastGroup
//! ```
//!
//! All mutation of clients, document state and awareness happens inside the
//! room's mutex, and frames are published to the broadcast group before the
//! lock is released. Every recipient therefore sees frames in the order the
//! room applied the events that produced them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::awareness::AwarenessTable;
use crate::broadcast::{BroadcastGroup, BroadcastStats, Envelope};
use crate::document::{DocumentState, MergeError, YrsDocument};
use crate::protocol::{AwarenessUpdate, ProtocolError, SyncMessage};

/// Identity of one live transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room {room} is full ({limit} clients)")]
    Full { room: String, limit: usize },
    #[error("room {0} has been closed")]
    Closed(String),
    #[error("connection {0} is not a member of room {1}")]
    NotJoined(ConnectionId, String),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Per-connection bookkeeping held by the room.
#[derive(Debug, Default)]
struct ClientEntry {
    /// Awareness ids this connection has published
    awareness_ids: HashSet<u64>,
    /// Highest awareness clock accepted from this connection
    last_awareness_clock: u64,
}

struct RoomState<D> {
    clients: HashMap<ConnectionId, ClientEntry>,
    document: D,
    awareness: AwarenessTable,
    /// Set when the last client leaves; a closed room accepts no joins
    closed: bool,
}

/// A connection's membership in a room. Fixed for the connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHandle {
    pub connection_id: ConnectionId,
    pub room_id: String,
}

/// Everything a freshly joined connection needs.
pub struct Joined {
    pub handle: ClientHandle,
    /// Room frames published after the join
    pub receiver: broadcast::Receiver<Envelope>,
    /// Handshake frames to send before anything from `receiver`
    pub initial_frames: Vec<Vec<u8>>,
}

/// Result of removing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub remaining: usize,
    /// Number of awareness tombstones broadcast for the departed client
    pub tombstones: usize,
}

impl Departure {
    pub fn room_emptied(&self) -> bool {
        self.remaining == 0
    }
}

pub struct Room<D: DocumentState = YrsDocument> {
    id: String,
    state: Mutex<RoomState<D>>,
    broadcast: BroadcastGroup,
    max_clients: usize,
}

impl<D: DocumentState> Room<D> {
    pub fn new(id: impl Into<String>, max_clients: usize, broadcast_capacity: usize) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(RoomState {
                clients: HashMap::new(),
                document: D::default(),
                awareness: AwarenessTable::new(),
                closed: false,
            }),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            max_clients,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attach a connection and build its handshake.
    ///
    /// The handshake is SyncStep1 (our state vector), SyncStep2 (full state)
    /// and, if anyone is present, an awareness snapshot. The broadcast
    /// receiver is subscribed under the same lock, so nothing published after
    /// the snapshot is missed.
    pub async fn join(&self, connection: ConnectionId) -> Result<Joined, RoomError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RoomError::Closed(self.id.clone()));
        }
        if state.clients.len() >= self.max_clients {
            return Err(RoomError::Full {
                room: self.id.clone(),
                limit: self.max_clients,
            });
        }

        let mut initial_frames = vec![
            SyncMessage::SyncStep1(state.document.state_vector()).encode()?,
            SyncMessage::SyncStep2(state.document.snapshot()).encode()?,
        ];
        let presence = state.awareness.snapshot();
        if !presence.is_empty() {
            initial_frames.push(SyncMessage::Awareness(presence).encode()?);
        }

        state.clients.insert(connection, ClientEntry::default());
        let receiver = self.broadcast.subscribe();

        log::info!(
            "Connection {connection} joined room {} ({} clients)",
            self.id,
            state.clients.len()
        );

        Ok(Joined {
            handle: ClientHandle {
                connection_id: connection,
                room_id: self.id.clone(),
            },
            receiver,
            initial_frames,
        })
    }

    /// Process one decoded message from `connection`.
    ///
    /// Returns a direct reply for the sender, if any. Relayed frames go to
    /// the broadcast group. On error nothing is merged or relayed.
    pub async fn handle(
        &self,
        connection: ConnectionId,
        message: SyncMessage,
    ) -> Result<Option<SyncMessage>, RoomError> {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        if !state.clients.contains_key(&connection) {
            return Err(RoomError::NotJoined(connection, self.id.clone()));
        }

        match message {
            SyncMessage::SyncStep1(state_vector) => {
                let diff = state.document.diff(&state_vector)?;
                Ok(Some(SyncMessage::SyncStep2(diff)))
            }

            // A step-2 answers our step-1: it carries what we were missing,
            // which is new to the other peers as well.
            SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => {
                if !state.document.apply(&update)? {
                    log::trace!("Room {}: empty update from {connection} not relayed", self.id);
                    return Ok(None);
                }
                let frame = SyncMessage::Update(update).encode()?;
                let receivers = self.broadcast.send(Some(connection), frame);
                log::debug!(
                    "Room {}: relayed update from {connection} to {} peers",
                    self.id,
                    receivers.saturating_sub(1)
                );
                Ok(None)
            }

            SyncMessage::Awareness(update) => {
                // Ids published by another live connection belong to it
                let (own, foreign): (Vec<_>, Vec<_>) =
                    update.entries.into_iter().partition(|entry| {
                        !state.clients.iter().any(|(id, other)| {
                            *id != connection && other.awareness_ids.contains(&entry.client_id)
                        })
                    });
                if !foreign.is_empty() {
                    log::debug!(
                        "Room {}: ignored {} awareness entries from {connection} owned by other connections",
                        self.id,
                        foreign.len()
                    );
                }

                let accepted = state.awareness.apply(&AwarenessUpdate::new(own));
                if accepted.is_empty() {
                    return Ok(None);
                }
                let Some(client) = state.clients.get_mut(&connection) else {
                    return Err(RoomError::NotJoined(connection, self.id.clone()));
                };
                for entry in &accepted.entries {
                    client.last_awareness_clock = client.last_awareness_clock.max(entry.clock);
                    if entry.is_tombstone() {
                        client.awareness_ids.remove(&entry.client_id);
                    } else {
                        client.awareness_ids.insert(entry.client_id);
                    }
                }
                let frame = SyncMessage::Awareness(accepted).encode()?;
                self.broadcast.send(Some(connection), frame);
                Ok(None)
            }

            SyncMessage::Ping => Ok(Some(SyncMessage::Pong)),
            SyncMessage::Pong => Ok(None),
        }
    }

    /// Detach a connection and tombstone the presence it owned.
    ///
    /// When the last client leaves the room is closed for good; the registry
    /// then drops it.
    pub async fn leave(&self, connection: ConnectionId) -> Departure {
        let mut state = self.state.lock().await;
        let Some(client) = state.clients.remove(&connection) else {
            return Departure {
                remaining: state.clients.len(),
                tombstones: 0,
            };
        };

        let tombstones = state.awareness.remove(&client.awareness_ids);
        let tombstone_count = tombstones.entries.len();
        if !tombstones.is_empty() {
            match SyncMessage::Awareness(tombstones).encode() {
                Ok(frame) => {
                    self.broadcast.send(None, frame);
                }
                Err(e) => log::error!("Room {}: failed to encode tombstones: {e}", self.id),
            }
        }

        let remaining = state.clients.len();
        if remaining == 0 {
            state.closed = true;
        }

        log::info!(
            "Connection {connection} left room {} ({remaining} clients remain)",
            self.id
        );

        Departure {
            remaining,
            tombstones: tombstone_count,
        }
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn has_client(&self, connection: ConnectionId) -> bool {
        self.state.lock().await.clients.contains_key(&connection)
    }

    /// Highest awareness clock accepted from `connection`.
    pub async fn last_awareness_clock(&self, connection: ConnectionId) -> Option<u64> {
        let state = self.state.lock().await;
        state.clients.get(&connection).map(|c| c.last_awareness_clock)
    }

    /// The accumulated document as a single update.
    pub async fn document_snapshot(&self) -> Vec<u8> {
        self.state.lock().await.document.snapshot()
    }

    pub async fn document_state_vector(&self) -> Vec<u8> {
        self.state.lock().await.document.state_vector()
    }

    pub async fn awareness_snapshot(&self) -> AwarenessUpdate {
        self.state.lock().await.awareness.snapshot()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcast.stats()
    }

    /// Account for frames a lagging receiver lost.
    pub fn record_dropped(&self, count: u64) {
        self.broadcast.record_dropped(count);
    }
}
