//! End-to-end scenarios over a [`LoopbackTransport`] standing in for the
//! remote server.

use std::sync::Arc;

use taskstore_core::channel::{DuplexChannel, ItemOutcome, LoopbackTransport, WireMessage};
use taskstore_core::config::{ConflictStrategy, StoreConfig};
use taskstore_core::metrics::MetricsCollector;
use taskstore_core::queue::ChangeQueue;
use taskstore_core::store::{InMemoryHost, LocalStore};
use taskstore_core::sync::SyncEngine;
use taskstore_core::types::{DeviceId, Operation, TableName};

fn config() -> StoreConfig {
    StoreConfig::default().with_batch_size(10)
}

async fn fake_server_batch_reply(
    mut peer_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    peer_tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    outcomes: Vec<ItemOutcome>,
) {
    let Some(bytes) = peer_rx.recv().await else { return };
    let WireMessage::Batch { batch_id, .. } =
        serde_json::from_slice::<WireMessage>(&bytes).expect("server received a batch envelope")
    else {
        panic!("expected a batch message");
    };
    let response = WireMessage::BatchResponse {
        timestamp: chrono::Utc::now(),
        batch_id,
        results: outcomes,
    };
    let reply = serde_json::to_vec(&response).unwrap();
    let _ = peer_tx.send(reply);
}

#[tokio::test]
async fn offline_then_online_drains_the_queue_and_records_a_metric() {
    let store = Arc::new(LocalStore::open_in_memory(Arc::new(InMemoryHost::new())).unwrap());
    let device = DeviceId::new();
    let queue = ChangeQueue::new(&store);
    for row_id in ["i1", "i2", "i3"] {
        queue
            .enqueue(
                TableName::Issues,
                row_id,
                Operation::Create,
                &serde_json::json!({"title": row_id}),
                device,
            )
            .unwrap();
    }
    assert_eq!(queue.stats().unwrap().pending, 3);

    let cfg = config();
    let channel = DuplexChannel::new(cfg.device_id, cfg.reconnect, cfg.heartbeat_interval);
    let (transport, peer_tx, peer_rx) = LoopbackTransport::pair();
    channel.connect_with(Arc::new(transport)).await.unwrap();

    let server = tokio::spawn(fake_server_batch_reply(
        peer_rx,
        peer_tx,
        vec![ItemOutcome::success(), ItemOutcome::success(), ItemOutcome::success()],
    ));

    let engine = SyncEngine::new(store.clone(), channel, MetricsCollector::new(), cfg);
    engine.sync().await.unwrap();
    server.await.unwrap();

    assert_eq!(queue.stats().unwrap().pending, 0);
    store
        .with_handle(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sync_metrics WHERE kind = 'full_sync' AND success = 1",
                [],
                |r| r.get(0),
            )?;
            assert_eq!(count, 1);
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn auto_resolvable_conflict_merges_disjoint_fields() {
    let store = Arc::new(LocalStore::open_in_memory(Arc::new(InMemoryHost::new())).unwrap());
    let device = DeviceId::new();
    let queue = ChangeQueue::new(&store);
    queue
        .enqueue(
            TableName::Issues,
            "i1",
            Operation::Update,
            &serde_json::json!({"title": "A"}),
            device,
        )
        .unwrap();

    let cfg = config().with_conflict_strategy(ConflictStrategy::Merge);
    let channel = DuplexChannel::new(cfg.device_id, cfg.reconnect, cfg.heartbeat_interval);
    let (transport, peer_tx, peer_rx) = LoopbackTransport::pair();
    channel.connect_with(Arc::new(transport)).await.unwrap();

    // Remote only touched `priority`, a disjoint field from the local
    // change's `title`: Merge can union both without escalating.
    let server = tokio::spawn(fake_server_batch_reply(
        peer_rx,
        peer_tx,
        vec![ItemOutcome::conflict_with_data(
            "UPDATE_UPDATE",
            1,
            serde_json::json!({"priority": "high"}),
        )],
    ));

    let engine = SyncEngine::new(store.clone(), channel, MetricsCollector::new(), cfg);
    engine.sync().await.unwrap();
    server.await.unwrap();

    // Merge auto-resolves on a disjoint-field conflict: the row is marked
    // synced rather than escalated, and no conflict row persists.
    assert_eq!(queue.stats().unwrap().pending, 0);
    store
        .with_handle(|conn| {
            let conflicts: i64 = conn.query_row("SELECT COUNT(*) FROM sync_conflicts", [], |r| r.get(0))?;
            assert_eq!(conflicts, 0);
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn user_escalated_conflict_persists_a_conflict_record() {
    let store = Arc::new(LocalStore::open_in_memory(Arc::new(InMemoryHost::new())).unwrap());
    let device = DeviceId::new();
    let queue = ChangeQueue::new(&store);
    queue
        .enqueue(
            TableName::Issues,
            "i1",
            Operation::Update,
            &serde_json::json!({"title": "X"}),
            device,
        )
        .unwrap();

    let cfg = config().with_conflict_strategy(ConflictStrategy::Merge);
    let channel = DuplexChannel::new(cfg.device_id, cfg.reconnect, cfg.heartbeat_interval);
    let (transport, peer_tx, peer_rx) = LoopbackTransport::pair();
    channel.connect_with(Arc::new(transport)).await.unwrap();

    // Remote changed the same critical field (`title`): Merge escalates
    // rather than silently picking a winner.
    let server = tokio::spawn(fake_server_batch_reply(
        peer_rx,
        peer_tx,
        vec![ItemOutcome::conflict_with_data(
            "UPDATE_UPDATE",
            1,
            serde_json::json!({"title": "Y"}),
        )],
    ));

    let engine = SyncEngine::new(store.clone(), channel, MetricsCollector::new(), cfg);
    engine.sync().await.unwrap();
    server.await.unwrap();

    store
        .with_handle(|conn| {
            let (kind, resolution): (String, Option<String>) = conn.query_row(
                "SELECT kind, resolution FROM sync_conflicts WHERE row_id = 'i1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            assert_eq!(kind, "UPDATE_UPDATE");
            assert!(resolution.is_none());
            Ok(())
        })
        .unwrap();
}
