//! Integration tests for presence (awareness) relay.

mod common;

use common::*;
use tandem_sync::client::{SyncClient, SyncEvent};
use tandem_sync::protocol::{AwarenessEntry, AwarenessUpdate, SyncMessage};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn presence(client_id: u64, clock: u64, state: &str) -> SyncMessage {
    SyncMessage::Awareness(AwarenessUpdate::new(vec![AwarenessEntry::new(
        client_id,
        clock,
        state.as_bytes(),
    )]))
}

async fn next_awareness(events: &mut mpsc::Receiver<SyncEvent>) -> AwarenessUpdate {
    let found = timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if let SyncEvent::Awareness(update) = event {
                return Some(update);
            }
        }
        None
    })
    .await;
    found
        .expect("timed out waiting for awareness")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_awareness_relayed_and_snapshotted() {
    let server = start_test_server().await;
    let (mut a, _) = join(&server, "r1").await;
    let (mut b, _) = join(&server, "r1").await;

    send(&mut a, presence(1, 1, "cursor@3")).await;
    assert_eq!(recv(&mut b).await, presence(1, 1, "cursor@3"));

    // Late joiners get the current presence after the document state
    let (mut c, _) = join(&server, "r1").await;
    assert_eq!(recv(&mut c).await, presence(1, 1, "cursor@3"));
}

#[tokio::test]
async fn test_stale_awareness_dropped() {
    let server = start_test_server().await;
    let (mut a, _) = join(&server, "r1").await;
    let (mut b, _) = join(&server, "r1").await;

    send(&mut a, presence(1, 5, "fresh")).await;
    assert_eq!(recv(&mut b).await, presence(1, 5, "fresh"));

    send(&mut a, presence(1, 3, "older")).await;
    send(&mut a, presence(1, 5, "replayed")).await;
    barrier(&mut a).await;
    expect_silence(&mut b).await;

    let room = server.server.registry().get("r1").await.unwrap();
    let snapshot = room.awareness_snapshot().await;
    assert_eq!(snapshot.entries.len(), 1);
    assert_eq!(snapshot.entries[0].state.as_deref(), Some(&b"fresh"[..]));
}

#[tokio::test]
async fn test_mixed_awareness_forwards_accepted_entries() {
    let server = start_test_server().await;
    let (mut a, _) = join(&server, "r1").await;
    let (mut b, _) = join(&server, "r1").await;

    send(&mut a, presence(1, 4, "one")).await;
    assert_eq!(recv(&mut b).await, presence(1, 4, "one"));

    let mixed = AwarenessUpdate::new(vec![
        AwarenessEntry::new(1, 2, b"stale".to_vec()),
        AwarenessEntry::new(2, 1, b"two".to_vec()),
    ]);
    send(&mut a, SyncMessage::Awareness(mixed)).await;
    assert_eq!(recv(&mut b).await, presence(2, 1, "two"));
}

#[tokio::test]
async fn test_tombstone_on_disconnect() {
    let server = start_test_server().await;
    let (mut a, _) = join(&server, "r1").await;
    let (mut b, _) = join(&server, "r1").await;

    send(&mut a, presence(7, 2, "typing")).await;
    assert_eq!(recv(&mut b).await, presence(7, 2, "typing"));

    a.close(None).await.unwrap();
    let expected = SyncMessage::Awareness(AwarenessUpdate::new(vec![AwarenessEntry::tombstone(
        7, 3,
    )]));
    assert_eq!(recv(&mut b).await, expected);

    let room = server.server.registry().get("r1").await.unwrap();
    assert!(room.awareness_snapshot().await.is_empty());
}

#[tokio::test]
async fn test_no_tombstone_without_presence() {
    let server = start_test_server().await;
    let (mut a, _) = join(&server, "r1").await;
    let (mut b, _) = join(&server, "r1").await;

    a.close(None).await.unwrap();
    let room = &server.server.registry().get("r1").await.unwrap();
    eventually(|| async move { room.client_count().await == 1 }).await;
    expect_silence(&mut b).await;
}

#[tokio::test]
async fn test_cleared_presence_not_tombstoned_again() {
    let server = start_test_server().await;
    let (mut a, _) = join(&server, "r1").await;
    let (mut b, _) = join(&server, "r1").await;

    send(&mut a, presence(7, 1, "here")).await;
    assert_eq!(recv(&mut b).await, presence(7, 1, "here"));

    let cleared = SyncMessage::Awareness(AwarenessUpdate::new(vec![AwarenessEntry::tombstone(
        7, 2,
    )]));
    send(&mut a, cleared.clone()).await;
    assert_eq!(recv(&mut b).await, cleared);

    a.close(None).await.unwrap();
    expect_silence(&mut b).await;
}

#[tokio::test]
async fn test_client_presence_round_trip() {
    let server = start_test_server().await;

    let mut x: SyncClient = SyncClient::new(server.url(), "r1").with_awareness_id(11);
    x.connect().await.unwrap();

    let mut y: SyncClient = SyncClient::new(server.url(), "r1").with_awareness_id(22);
    let mut y_events = y.take_event_rx().unwrap();
    y.connect().await.unwrap();
    // Y's first Synced event means its join is complete
    timeout(WAIT, async {
        while let Some(event) = y_events.recv().await {
            if event == SyncEvent::Synced {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(x.set_presence(b"selection 1..4".to_vec()).await.unwrap(), 1);
    let seen = next_awareness(&mut y_events).await;
    assert_eq!(seen.entries, vec![AwarenessEntry::new(11, 1, b"selection 1..4".to_vec())]);
    assert_eq!(y.remote_presence().await.entries.len(), 1);

    // Disconnecting X tombstones its presence at Y
    x.disconnect().await.unwrap();
    let gone = next_awareness(&mut y_events).await;
    assert_eq!(gone.entries, vec![AwarenessEntry::tombstone(11, 2)]);
    assert!(y.remote_presence().await.is_empty());
}
