//! Shared harness: a real server on a free port and raw WebSocket helpers.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tandem_sync::protocol::SyncMessage;
use tandem_sync::server::{ServerConfig, ServerError, SyncServer};
use tandem_sync::YrsDocument;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use yrs::{GetString, Text, Transact, WriteTxn};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(2);

pub struct TestServer {
    pub port: u16,
    pub server: Arc<SyncServer>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    pub fn room_url(&self, room: &str) -> String {
        format!("{}/{room}", self.url())
    }

    /// Resolve the shutdown signal and wait for the server to drain.
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        timeout(WAIT, self.task)
            .await
            .expect("server did not stop in time")
            .expect("server task panicked")
    }
}

/// Start a server on a free port.
pub async fn start_test_server() -> TestServer {
    start_test_server_with(ServerConfig::default()).await
}

pub async fn start_test_server_with(config: ServerConfig) -> TestServer {
    let server = Arc::new(SyncServer::new(ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..config
    }));
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (tx, rx) = oneshot::channel::<()>();
    let serving = server.clone();
    let task = tokio::spawn(async move {
        serving
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
    });

    TestServer {
        port,
        server,
        shutdown: Some(tx),
        task,
    }
}

/// Open a raw socket to `room` and consume the SyncStep1/SyncStep2 handshake.
///
/// Returns the socket and the room state carried by SyncStep2. A presence
/// snapshot, if the room has one, is left unread.
pub async fn join(server: &TestServer, room: &str) -> (Ws, Vec<u8>) {
    let (mut ws, _) = tokio_tungstenite::connect_async(server.room_url(room))
        .await
        .unwrap();
    assert!(matches!(recv(&mut ws).await, SyncMessage::SyncStep1(_)));
    let SyncMessage::SyncStep2(state) = recv(&mut ws).await else {
        panic!("expected SyncStep2 in handshake");
    };
    (ws, state)
}

pub async fn send(ws: &mut Ws, message: SyncMessage) {
    ws.send(Message::Binary(message.encode().unwrap().into()))
        .await
        .unwrap();
}

/// Next protocol message, skipping transport pings.
pub async fn next_message(ws: &mut Ws) -> Option<SyncMessage> {
    while let Some(frame) = ws.next().await {
        match frame.ok()? {
            Message::Binary(data) => return Some(SyncMessage::decode(&data).unwrap()),
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return None,
        }
    }
    None
}

pub async fn recv(ws: &mut Ws) -> SyncMessage {
    timeout(WAIT, next_message(ws))
        .await
        .expect("timed out waiting for a message")
        .expect("connection ended")
}

/// Assert nothing arrives for a short while.
pub async fn expect_silence(ws: &mut Ws) {
    let result = timeout(Duration::from_millis(200), next_message(ws)).await;
    assert!(result.is_err(), "unexpected message: {result:?}");
}

/// Round-trip a PING. Everything sent before it has been processed once the
/// PONG is back, since a connection's frames are handled in order.
pub async fn barrier(ws: &mut Ws) {
    send(ws, SyncMessage::Ping).await;
    loop {
        if recv(ws).await == SyncMessage::Pong {
            return;
        }
    }
}

/// Read until the server's close frame and return its code.
pub async fn recv_close(ws: &mut Ws) -> Option<CloseCode> {
    let closing = async {
        while let Some(frame) = ws.next().await {
            match frame {
                Ok(Message::Close(frame)) => return frame.map(|f| f.code),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    };
    timeout(WAIT, closing).await.expect("no close frame")
}

/// Poll `check` until it holds or the wait runs out.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let polling = async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(WAIT, polling).await.expect("condition never held");
}

/// An update inserting `content` at the start of the `content` text.
pub fn text_update(client_id: u64, content: &str) -> Vec<u8> {
    let doc = yrs::Doc::with_client_id(client_id);
    let mut txn = doc.transact_mut();
    let text = txn.get_or_insert_text("content");
    text.insert(&mut txn, 0, content);
    txn.encode_update_v1()
}

pub fn read_text(doc: &YrsDocument) -> String {
    let mut txn = doc.doc().transact_mut();
    let text = txn.get_or_insert_text("content");
    text.get_string(&txn)
}

/// Text carried by a full-state update.
pub fn text_of(update: &[u8]) -> String {
    use tandem_sync::DocumentState;
    let mut doc = YrsDocument::new();
    doc.apply(update).unwrap();
    read_text(&doc)
}
