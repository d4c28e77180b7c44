//! Binary framing for the room sync protocol.
//!
//! Every WebSocket binary frame carries exactly one message:
//! ```text
//! ┌──────────┬──────────────────────────────────────────────┐
//! │ msg_type │ payload                                      │
//! │ 1 byte   │ variable (depends on msg_type)               │
//! └──────────┴──────────────────────────────────────────────┘
//! ```
//!
//! | Type        | Payload                                         |
//! |-------------|-------------------------------------------------|
//! | SyncStep1   | opaque state vector (rest of frame)             |
//! | SyncStep2   | opaque document update (rest of frame)          |
//! | Update      | opaque incremental delta (rest of frame)        |
//! | Awareness   | bincode-encoded [`AwarenessUpdate`]             |
//! | Ping / Pong | empty                                           |
//!
//! Document payloads are never interpreted here. Failing to decode a frame is
//! a [`ProtocolError`], which is always fatal to the connection that sent it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message discriminant, the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// State vector describing what the sender already knows
    SyncStep1 = 1,
    /// Document update answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental CRDT delta
    Update = 3,
    /// Presence entries with per-client clocks
    Awareness = 4,
    /// Liveness probe
    Ping = 5,
    /// Liveness reply
    Pong = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(Self::SyncStep1),
            2 => Ok(Self::SyncStep2),
            3 => Ok(Self::Update),
            4 => Ok(Self::Awareness),
            5 => Ok(Self::Ping),
            6 => Ok(Self::Pong),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// One client's presence record inside an awareness message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    /// Awareness identity chosen by the client (not the connection id)
    pub client_id: u64,
    /// Monotonic per-client sequence number
    pub clock: u64,
    /// Opaque presence blob (cursor, name, color). `None` = client gone.
    pub state: Option<Vec<u8>>,
}

impl AwarenessEntry {
    pub fn new(client_id: u64, clock: u64, state: impl Into<Vec<u8>>) -> Self {
        Self {
            client_id,
            clock,
            state: Some(state.into()),
        }
    }

    /// Entry announcing that `client_id` is no longer present.
    pub fn tombstone(client_id: u64, clock: u64) -> Self {
        Self {
            client_id,
            clock,
            state: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.state.is_none()
    }
}

/// Payload of an [`MessageType::Awareness`] frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn new(entries: Vec<AwarenessEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    SyncStep1(Vec<u8>),
    SyncStep2(Vec<u8>),
    Update(Vec<u8>),
    Awareness(AwarenessUpdate),
    Ping,
    Pong,
}

impl SyncMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::SyncStep1(_) => MessageType::SyncStep1,
            Self::SyncStep2(_) => MessageType::SyncStep2,
            Self::Update(_) => MessageType::Update,
            Self::Awareness(_) => MessageType::Awareness,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
        }
    }

    /// Serialize to a single binary frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let tag = self.message_type() as u8;
        match self {
            Self::SyncStep1(payload) | Self::SyncStep2(payload) | Self::Update(payload) => {
                let mut frame = Vec::with_capacity(1 + payload.len());
                frame.push(tag);
                frame.extend_from_slice(payload);
                Ok(frame)
            }
            Self::Awareness(update) => {
                let body = bincode::serde::encode_to_vec(update, bincode::config::standard())
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                let mut frame = Vec::with_capacity(1 + body.len());
                frame.push(tag);
                frame.extend_from_slice(&body);
                Ok(frame)
            }
            Self::Ping | Self::Pong => Ok(vec![tag]),
        }
    }

    /// Parse a single binary frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, payload) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let msg_type = MessageType::try_from(tag)?;

        match msg_type {
            MessageType::SyncStep1 => Ok(Self::SyncStep1(payload.to_vec())),
            MessageType::SyncStep2 => Ok(Self::SyncStep2(payload.to_vec())),
            MessageType::Update => Ok(Self::Update(payload.to_vec())),
            MessageType::Awareness => {
                let (update, read): (AwarenessUpdate, usize) =
                    bincode::serde::decode_from_slice(payload, bincode::config::standard())
                        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
                if read != payload.len() {
                    return Err(ProtocolError::TrailingBytes(payload.len() - read));
                }
                Ok(Self::Awareness(update))
            }
            MessageType::Ping | MessageType::Pong => {
                if !payload.is_empty() {
                    return Err(ProtocolError::UnexpectedPayload(msg_type, payload.len()));
                }
                Ok(if msg_type == MessageType::Ping {
                    Self::Ping
                } else {
                    Self::Pong
                })
            }
        }
    }
}

/// Framing errors. Distinct from [`crate::document::MergeError`], which
/// reports well-framed but corrupt document content.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("{0:?} message carries {1} unexpected payload bytes")]
    UnexpectedPayload(MessageType, usize),
    #[error("{0} trailing bytes after awareness payload")]
    TrailingBytes(usize),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}
