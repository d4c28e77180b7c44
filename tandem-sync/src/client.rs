//! WebSocket sync client for connecting to a room.
//!
//! Keeps a local replica of the room document and speaks the same protocol
//! as editor clients:
//! - answers the server's SyncStep1 with whatever the server is missing
//! - merges SyncStep2 and Update frames into the local replica
//! - tracks remote presence with the same clock rules as the server
//!
//! Local edits made while disconnected are merged locally only. The sync
//! handshake on the next `connect` carries them to the server, so no separate
//! offline queue is needed.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::awareness::AwarenessTable;
use crate::document::{DocumentState, MergeError, YrsDocument};
use crate::protocol::{AwarenessEntry, AwarenessUpdate, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Server's SyncStep2 merged into the local replica
    Synced,
    /// Remote update merged into the local replica
    RemoteUpdate(Vec<u8>),
    /// Accepted remote presence changes
    Awareness(AwarenessUpdate),
    /// Reply to [`SyncClient::send_ping`]
    Pong,
    /// Connection lost; carries the server's close code if it sent one
    Disconnected { code: Option<u16> },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// The sync client.
pub struct SyncClient<D: DocumentState = YrsDocument> {
    server_url: String,
    room_id: String,
    /// Local replica of the room document
    document: Arc<Mutex<D>>,
    /// Remote presence, by awareness id
    presence: Arc<Mutex<AwarenessTable>>,
    /// Our awareness identity and clock
    awareness_id: u64,
    awareness_clock: Mutex<u64>,
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl<D: DocumentState> SyncClient<D> {
    /// Client for `ws://host:port` (no trailing slash) and a room id.
    pub fn new(server_url: impl Into<String>, room_id: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            document: Arc::new(Mutex::new(D::default())),
            presence: Arc::new(Mutex::new(AwarenessTable::new())),
            awareness_id: Uuid::new_v4().as_u64_pair().0,
            awareness_clock: Mutex::new(0),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Use a fixed awareness id instead of a random one.
    pub fn with_awareness_id(mut self, awareness_id: u64) -> Self {
        self.awareness_id = awareness_id;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and start the sync handshake.
    ///
    /// Spawns a writer task and a reader task; events arrive on the receiver
    /// from [`SyncClient::take_event_rx`].
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url, self.room_id);
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Ask for whatever the room has that we don't
        let state_vector = self.document.lock().await.state_vector();
        let hello = SyncMessage::SyncStep1(state_vector).encode()?;
        out_tx
            .send(Message::Binary(hello.into()))
            .await
            .map_err(|_| ClientError::NotConnected)?;

        self.outgoing_tx = Some(out_tx.clone());
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: process incoming frames
        let document = self.document.clone();
        let presence = self.presence.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut close_code = None;
            while let Some(frame) = ws_reader.next().await {
                let data = match frame {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(close)) => {
                        close_code = close.map(|c| u16::from(c.code));
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        log::debug!("Sync client read error: {e}");
                        break;
                    }
                };

                let message = match SyncMessage::decode(&data) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Ignoring malformed frame from server: {e}");
                        continue;
                    }
                };

                let event = match message {
                    SyncMessage::SyncStep1(state_vector) => {
                        let diff = document.lock().await.diff(&state_vector);
                        match diff.map_err(ClientError::from).and_then(|d| {
                            SyncMessage::SyncStep2(d).encode().map_err(ClientError::from)
                        }) {
                            Ok(reply) => {
                                let _ = out_tx.send(Message::Binary(reply.into())).await;
                            }
                            Err(e) => log::warn!("Cannot answer server state vector: {e}"),
                        }
                        None
                    }
                    SyncMessage::SyncStep2(update) => {
                        match document.lock().await.apply(&update) {
                            Ok(_) => Some(SyncEvent::Synced),
                            Err(e) => {
                                log::warn!("Failed to merge server state: {e}");
                                None
                            }
                        }
                    }
                    SyncMessage::Update(update) => {
                        match document.lock().await.apply(&update) {
                            Ok(true) => Some(SyncEvent::RemoteUpdate(update)),
                            Ok(false) => None,
                            Err(e) => {
                                log::warn!("Failed to merge remote update: {e}");
                                None
                            }
                        }
                    }
                    SyncMessage::Awareness(update) => {
                        let accepted = presence.lock().await.apply(&update);
                        (!accepted.is_empty()).then_some(SyncEvent::Awareness(accepted))
                    }
                    SyncMessage::Ping => {
                        if let Ok(pong) = SyncMessage::Pong.encode() {
                            let _ = out_tx.send(Message::Binary(pong.into())).await;
                        }
                        None
                    }
                    SyncMessage::Pong => Some(SyncEvent::Pong),
                };

                if let Some(event) = event {
                    let _ = event_tx.send(event).await;
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx
                .send(SyncEvent::Disconnected { code: close_code })
                .await;
        });

        Ok(())
    }

    /// Merge a local edit and send it to the room.
    ///
    /// While disconnected the edit is only merged locally; it reaches the
    /// room through the handshake on the next connect.
    pub async fn apply_local(&self, update: Vec<u8>) -> Result<(), ClientError> {
        self.document.lock().await.apply(&update)?;
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(SyncMessage::Update(update)).await
    }

    /// Publish our presence with the next clock value.
    pub async fn set_presence(&self, state: impl Into<Vec<u8>>) -> Result<u64, ClientError> {
        let clock = self.next_awareness_clock().await;
        let entry = AwarenessEntry::new(self.awareness_id, clock, state);
        self.send(SyncMessage::Awareness(AwarenessUpdate::new(vec![entry])))
            .await?;
        Ok(clock)
    }

    /// Announce that we are no longer present.
    pub async fn clear_presence(&self) -> Result<u64, ClientError> {
        let clock = self.next_awareness_clock().await;
        let entry = AwarenessEntry::tombstone(self.awareness_id, clock);
        self.send(SyncMessage::Awareness(AwarenessUpdate::new(vec![entry])))
            .await?;
        Ok(clock)
    }

    /// Send a presence entry with an explicit clock, bypassing our counter.
    pub async fn send_awareness(&self, update: AwarenessUpdate) -> Result<(), ClientError> {
        self.send(SyncMessage::Awareness(update)).await
    }

    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.send(SyncMessage::Ping).await
    }

    /// Send a raw binary frame as-is.
    pub async fn send_frame(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        self.send_message(Message::Binary(frame.into())).await
    }

    /// Start the closing handshake.
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        let result = self.send_message(Message::Close(None)).await;
        self.outgoing_tx = None;
        result
    }

    async fn send(&self, message: SyncMessage) -> Result<(), ClientError> {
        let frame = message.encode()?;
        self.send_message(Message::Binary(frame.into())).await
    }

    async fn send_message(&self, message: Message) -> Result<(), ClientError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(message)
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    async fn next_awareness_clock(&self) -> u64 {
        let mut clock = self.awareness_clock.lock().await;
        *clock += 1;
        *clock
    }

    /// Read the local replica.
    pub async fn with_document<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        f(&*self.document.lock().await)
    }

    /// Remote presence as currently known.
    pub async fn remote_presence(&self) -> AwarenessUpdate {
        self.presence.lock().await.snapshot()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn awareness_id(&self) -> u64 {
        self.awareness_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
