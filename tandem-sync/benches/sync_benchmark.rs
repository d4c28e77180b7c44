use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tandem_sync::awareness::AwarenessTable;
use tandem_sync::protocol::{AwarenessEntry, AwarenessUpdate, SyncMessage};
use tandem_sync::room::{ConnectionId, Room};
use tandem_sync::{DocumentState, YrsDocument};
use yrs::{Text, Transact, WriteTxn};

fn text_update(client_id: u64, len: usize) -> Vec<u8> {
    let doc = yrs::Doc::with_client_id(client_id);
    let mut txn = doc.transact_mut();
    let text = txn.get_or_insert_text("content");
    text.insert(&mut txn, 0, &"x".repeat(len));
    txn.encode_update_v1()
}

fn bench_update_encode(c: &mut Criterion) {
    let update = vec![0u8; 64]; // Typical keystroke-sized update

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::Update(black_box(update.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = SyncMessage::Update(vec![0u8; 64]).encode().unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_awareness_codec(c: &mut Criterion) {
    let entries = (0..32)
        .map(|id| AwarenessEntry::new(id, 1, vec![0u8; 48]))
        .collect();
    let msg = SyncMessage::Awareness(AwarenessUpdate::new(entries));
    let encoded = msg.encode().unwrap();

    c.bench_function("awareness_encode_32_peers", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
    c.bench_function("awareness_decode_32_peers", |b| {
        b.iter(|| black_box(SyncMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_awareness_table(c: &mut Criterion) {
    c.bench_function("awareness_apply_100_clients", |b| {
        let mut table = AwarenessTable::new();
        let mut clock = 0u64;
        b.iter(|| {
            clock += 1;
            for id in 0..100 {
                let update = AwarenessUpdate::new(vec![AwarenessEntry::new(id, clock, vec![1u8; 32])]);
                black_box(table.apply(&update));
            }
        })
    });
}

fn bench_document_merge(c: &mut Criterion) {
    let updates: Vec<Vec<u8>> = (1..=100).map(|id| text_update(id, 16)).collect();

    c.bench_function("yrs_merge_100_updates", |b| {
        b.iter(|| {
            let mut doc = YrsDocument::new();
            for update in &updates {
                doc.apply(black_box(update)).unwrap();
            }
            black_box(doc.state_vector());
        })
    });
}

fn bench_room_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let room: Room = Room::new("bench", 128, 2048);
    let sender = ConnectionId::new();
    let mut receivers = Vec::new();
    rt.block_on(async {
        receivers.push(room.join(sender).await.unwrap().receiver);
        for _ in 0..99 {
            receivers.push(room.join(ConnectionId::new()).await.unwrap().receiver);
        }
    });

    let update = text_update(1, 8);
    c.bench_function("room_update_fanout_100_clients", |b| {
        b.iter(|| {
            rt.block_on(async {
                room.handle(sender, SyncMessage::Update(update.clone()))
                    .await
                    .unwrap();
            });
            for rx in receivers.iter_mut() {
                black_box(rx.try_recv().unwrap());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_awareness_codec,
    bench_awareness_table,
    bench_document_merge,
    bench_room_fanout,
);
criterion_main!(benches);
