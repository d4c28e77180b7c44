//! One task per WebSocket connection.
//!
//! Lifecycle:
//! 1. Upgrade the socket, taking the room id from the request (gateway).
//! 2. Join the room and send its handshake frames.
//! 3. Relay: inbound frames go to the room in arrival order; room broadcasts
//!    go out in publication order, minus this connection's own frames.
//! 4. On any exit (peer close, error, keep-alive timeout, shutdown) release
//!    the room first, then close the socket.
//!
//! Nothing that goes wrong here reaches other connections.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::Envelope;
use crate::document::DocumentState;
use crate::gateway::RoomSelector;
use crate::protocol::{ProtocolError, SyncMessage};
use crate::registry::RoomRegistry;
use crate::room::{ConnectionId, Joined, Room, RoomError};
use crate::server::{AtomicServerStats, ServerConfig};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Upper bound on the closing handshake with a departing peer.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared server state handed to each connection task.
pub(crate) struct ConnectionContext<D: DocumentState> {
    pub registry: Arc<RoomRegistry<D>>,
    pub stats: Arc<AtomicServerStats>,
    pub config: Arc<ServerConfig>,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),
}

/// Why the relay loop stopped.
#[derive(Debug)]
enum Exit {
    PeerClosed,
    Transport(tungstenite::Error),
    Framing(ProtocolError),
    Content(RoomError),
    TextFrame,
    Lagged(u64),
    KeepaliveTimeout,
    Shutdown,
}

impl Exit {
    fn close_frame(&self) -> Option<CloseFrame> {
        let (code, reason) = match self {
            Exit::PeerClosed | Exit::Transport(_) => return None,
            Exit::Framing(_) => (CloseCode::Protocol, "malformed frame"),
            Exit::Content(_) => (CloseCode::Protocol, "corrupt update"),
            Exit::TextFrame => (CloseCode::Unsupported, "binary frames only"),
            Exit::Lagged(_) => (CloseCode::Again, "fell behind room, reconnect"),
            Exit::KeepaliveTimeout => (CloseCode::Normal, "keep-alive timeout"),
            Exit::Shutdown => (CloseCode::Away, "server shutting down"),
        };
        Some(CloseFrame {
            code,
            reason: reason.into(),
        })
    }
}

/// Serve one TCP connection from upgrade to teardown.
pub(crate) async fn handle_connection<D: DocumentState>(
    stream: TcpStream,
    addr: SocketAddr,
    mut ctx: ConnectionContext<D>,
) -> Result<(), ConnectionError> {
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(ctx.config.max_message_size))
        .max_frame_size(Some(ctx.config.max_message_size));

    let max_room_id_len = ctx.config.max_room_id_len;
    let handshake_timeout = ctx.config.handshake_timeout;

    // A peer that never finishes the upgrade must not hold up shutdown
    let mut selected = None;
    let handshake = tokio::select! {
        result = tokio::time::timeout(
            handshake_timeout,
            tokio_tungstenite::accept_hdr_async_with_config(
                stream,
                RoomSelector::new(max_room_id_len, &mut selected),
                Some(ws_config),
            ),
        ) => result,
        _ = ctx.shutdown.changed() => {
            log::debug!("Dropped pending upgrade from {addr}: shutting down");
            return Ok(());
        }
    };

    let ws_stream = match handshake {
        Ok(Ok(ws)) => ws,
        Err(_) => {
            ctx.stats.record_rejected();
            log::info!("Upgrade from {addr} timed out after {handshake_timeout:?}");
            return Ok(());
        }
        Ok(Err(e)) => {
            if let Some(Err(rejection)) = selected {
                ctx.stats.record_rejected();
                log::info!("Rejected connection from {addr}: {rejection}");
                return Ok(());
            }
            return Err(ConnectionError::Handshake(e));
        }
    };
    let Some(Ok(room_id)) = selected else {
        return Ok(());
    };

    let (mut sink, mut source) = ws_stream.split();
    let connection = ConnectionId::new();

    let (room, joined) = match ctx.registry.join(&room_id, connection).await {
        Ok(pair) => pair,
        Err(e) => {
            ctx.stats.record_rejected();
            log::warn!("Refused {addr} for room {room_id}: {e}");
            let frame = CloseFrame {
                code: CloseCode::Again,
                reason: "room unavailable".into(),
            };
            close(&mut sink, Some(frame)).await;
            return Ok(());
        }
    };

    ctx.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    ctx.stats.active_connections.fetch_add(1, Ordering::Relaxed);
    log::info!("WebSocket connection {connection} from {addr} attached to room {room_id}");

    let Joined {
        mut receiver,
        initial_frames,
        ..
    } = joined;
    let exit = relay(
        &room,
        connection,
        &mut sink,
        &mut source,
        &mut receiver,
        initial_frames,
        &mut ctx,
    )
    .await;

    // Stop listening before leaving, so the departing peer's tombstone isn't
    // queued for a receiver nobody reads
    drop(receiver);
    let departure = ctx.registry.release(&room, connection).await;
    ctx.stats.active_connections.fetch_sub(1, Ordering::Relaxed);

    match &exit {
        Exit::PeerClosed => log::info!("Connection {connection} closed by peer"),
        Exit::Transport(e) => log::warn!("Connection {connection} transport error: {e}"),
        Exit::Framing(e) => log::warn!("Connection {connection} sent a malformed frame: {e}"),
        Exit::Content(e) => log::warn!("Connection {connection} sent corrupt content: {e}"),
        Exit::TextFrame => log::warn!("Connection {connection} sent a text frame"),
        Exit::Lagged(n) => log::warn!("Connection {connection} lagged by {n} frames, disconnecting"),
        Exit::KeepaliveTimeout => log::info!("Connection {connection} timed out"),
        Exit::Shutdown => log::debug!("Connection {connection} closing for shutdown"),
    }
    log::debug!(
        "Room {room_id}: {} clients remain, {} presence tombstones sent",
        departure.remaining,
        departure.tombstones
    );

    close(&mut sink, exit.close_frame()).await;
    Ok(())
}

/// Duplex relay between one socket and its room.
#[allow(clippy::too_many_arguments)]
async fn relay<D: DocumentState>(
    room: &Room<D>,
    connection: ConnectionId,
    sink: &mut WsSink,
    source: &mut WsSource,
    receiver: &mut broadcast::Receiver<Envelope>,
    initial_frames: Vec<Vec<u8>>,
    ctx: &mut ConnectionContext<D>,
) -> Exit {
    for frame in initial_frames {
        if let Err(e) = sink.send(Message::Binary(frame.into())).await {
            return Exit::Transport(e);
        }
    }

    let period = ctx.config.keepalive_interval;
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut alive = true;

    loop {
        tokio::select! {
            // A dropped sender also means the server is going away
            _ = ctx.shutdown.changed() => return Exit::Shutdown,

            inbound = source.next() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return Exit::Transport(e),
                    None => return Exit::PeerClosed,
                };
                alive = true;

                match message {
                    Message::Binary(data) => {
                        ctx.stats.record_message(data.len());
                        let decoded = match SyncMessage::decode(&data) {
                            Ok(decoded) => decoded,
                            Err(e) => return Exit::Framing(e),
                        };
                        log::trace!("Connection {connection}: {:?}", decoded.message_type());

                        match room.handle(connection, decoded).await {
                            Ok(Some(reply)) => {
                                let frame = match reply.encode() {
                                    Ok(frame) => frame,
                                    Err(e) => return Exit::Framing(e),
                                };
                                if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                                    return Exit::Transport(e);
                                }
                            }
                            Ok(None) => {}
                            Err(e) => return Exit::Content(e),
                        }
                    }
                    Message::Text(_) => return Exit::TextFrame,
                    Message::Close(_) => return Exit::PeerClosed,
                    // Pings are answered by tungstenite; pongs only prove liveness
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }

            relayed = receiver.recv() => {
                match relayed {
                    Ok(envelope) => {
                        if envelope.is_echo_for(connection) {
                            continue;
                        }
                        let frame = Message::Binary(envelope.frame.to_vec().into());
                        if let Err(e) = sink.send(frame).await {
                            return Exit::Transport(e);
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        room.record_dropped(n);
                        return Exit::Lagged(n);
                    }
                    Err(RecvError::Closed) => return Exit::Shutdown,
                }
            }

            _ = keepalive.tick() => {
                if !alive {
                    return Exit::KeepaliveTimeout;
                }
                alive = false;
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    return Exit::Transport(e);
                }
            }
        }
    }
}

/// Best-effort closing handshake, bounded by [`CLOSE_TIMEOUT`].
async fn close(sink: &mut WsSink, frame: Option<CloseFrame>) {
    let closing = async {
        if let Some(frame) = frame {
            if sink.send(Message::Close(Some(frame))).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    };
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, closing).await;
}
