//! Process-wide map from room id to room.
//!
//! Rooms are created on first join and dropped as soon as the last client
//! leaves. The map lock is held only to look up, insert or evict an entry;
//! room traffic runs under each room's own lock, so unrelated rooms never
//! wait on each other.
//!
//! A room that emptied is marked closed before it is evicted. A join that
//! races with the eviction sees the closed room, evicts it itself and retries
//! against a fresh one, so no client is ever attached to an orphaned room.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::document::{DocumentState, YrsDocument};
use crate::room::{ConnectionId, Departure, Joined, Room, RoomError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("room limit reached ({0} rooms)")]
    TooManyRooms(usize),
    #[error(transparent)]
    Room(#[from] RoomError),
}

pub struct RoomRegistry<D: DocumentState = YrsDocument> {
    rooms: RwLock<HashMap<String, Arc<Room<D>>>>,
    max_rooms: usize,
    max_clients_per_room: usize,
    broadcast_capacity: usize,
}

impl<D: DocumentState> RoomRegistry<D> {
    pub fn new(max_rooms: usize, max_clients_per_room: usize, broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            max_rooms,
            max_clients_per_room,
            broadcast_capacity,
        }
    }

    /// Return the room for `room_id`, creating an empty one if absent.
    ///
    /// Concurrent calls for the same unseen id yield the same instance.
    pub async fn get_or_create(&self, room_id: &str) -> Result<Arc<Room<D>>, RegistryError> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return Ok(room.clone());
            }
        }

        // Slow path: write lock, double-check before creating
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            return Ok(room.clone());
        }
        if rooms.len() >= self.max_rooms {
            return Err(RegistryError::TooManyRooms(self.max_rooms));
        }

        let room = Arc::new(Room::new(
            room_id,
            self.max_clients_per_room,
            self.broadcast_capacity,
        ));
        rooms.insert(room_id.to_string(), room.clone());
        log::info!("Room {room_id} created ({} active)", rooms.len());
        Ok(room)
    }

    /// Attach `connection` to `room_id`, creating the room if needed.
    pub async fn join(
        &self,
        room_id: &str,
        connection: ConnectionId,
    ) -> Result<(Arc<Room<D>>, Joined), RegistryError> {
        loop {
            let room = self.get_or_create(room_id).await?;
            match room.join(connection).await {
                Ok(joined) => return Ok((room, joined)),
                Err(RoomError::Closed(_)) => {
                    // Lost a race with the last client leaving
                    self.evict(&room).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Detach `connection` from `room`; drop the room if it is now empty.
    pub async fn release(&self, room: &Arc<Room<D>>, connection: ConnectionId) -> Departure {
        let departure = room.leave(connection).await;
        if departure.room_emptied() {
            self.evict(room).await;
        }
        departure
    }

    /// Remove `room` from the map if the map still points at this instance.
    ///
    /// Safe to call more than once, and never removes a newer room that
    /// reuses the same id.
    async fn evict(&self, room: &Arc<Room<D>>) -> bool {
        let mut rooms = self.rooms.write().await;
        let current = rooms
            .get(room.id())
            .is_some_and(|existing| Arc::ptr_eq(existing, room));
        if current {
            rooms.remove(room.id());
            log::info!("Room {} removed (empty, {} active)", room.id(), rooms.len());
        }
        current
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room<D>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
