//! Fan-out of encoded frames to every connection in a room.
//!
//! Uses a tokio broadcast channel: one send reaches all subscribers, and each
//! subscriber reads frames in the order they were sent. Every frame is tagged
//! with the connection that caused it so receivers can skip their own
//! messages.
//!
//! The channel is bounded. A receiver that falls more than `capacity` frames
//! behind loses frames, which for CRDT updates means a diverged replica; the
//! connection layer treats that as fatal for the lagging peer only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::room::ConnectionId;

/// One encoded frame plus the connection it originated from.
///
/// `origin == None` marks server-originated frames (e.g. tombstones), which
/// every subscriber receives.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: Option<ConnectionId>,
    pub frame: Arc<Vec<u8>>,
}

impl Envelope {
    /// Whether `connection` should skip this frame (it sent it).
    pub fn is_echo_for(&self, connection: ConnectionId) -> bool {
        self.origin == Some(connection)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub receivers: usize,
}

/// Broadcast channel for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per receiver before a slow
    /// receiver starts losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Send a frame to every subscriber. Returns the number of receivers,
    /// including the origin, which filters the frame out itself.
    pub fn send(&self, origin: Option<ConnectionId>, frame: Vec<u8>) -> usize {
        let envelope = Envelope {
            origin,
            frame: Arc::new(frame),
        };
        let count = self.sender.send(envelope).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver lost.
    pub fn record_dropped(&self, count: u64) {
        self.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}
