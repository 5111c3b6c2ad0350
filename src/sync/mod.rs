//! Sync Engine (spec §4.E): orchestrates one logical "sync" cycle across
//! the Change Queue, Conflict Resolver, Duplex Channel, and Metrics
//! Collector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::params;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::channel::{DuplexChannel, ItemOutcome, WireMessage};
use crate::config::{ConflictStrategy, StoreConfig};
use crate::error::{Result, StoreError};
use crate::metrics::MetricsCollector;
use crate::queue::ChangeQueue;
use crate::resolver::{self, VersionedRecord};
use crate::store::LocalStore;
use crate::types::{ChangeRecord, ConflictKind, DeviceId, Operation, SyncKind, TableName};

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStatus {
    pub online: bool,
    pub syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub pending_changes: u64,
    pub conflicts: u64,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Progress { processed: u64, total: u64 },
    Conflict { table: TableName, row_id: String, kind: ConflictKind },
    Complete { pending: u64 },
}

type EventListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Drains B, pushes over D, routes conflicts through C, pulls remote
/// updates, and records a [`crate::types::SyncMetric`] per cycle (spec
/// §4.E).
pub struct SyncEngine {
    store: Arc<LocalStore>,
    channel: DuplexChannel,
    metrics: MetricsCollector,
    config: StoreConfig,
    in_progress: AtomicBool,
    last_sync_time: Mutex<Option<DateTime<Utc>>>,
    online: AtomicBool,
    listeners: Mutex<Vec<EventListener>>,
}

impl SyncEngine {
    pub fn new(store: Arc<LocalStore>, channel: DuplexChannel, metrics: MetricsCollector, config: StoreConfig) -> Self {
        Self {
            store,
            channel,
            metrics,
            config,
            in_progress: AtomicBool::new(false),
            last_sync_time: Mutex::new(None),
            online: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn on_event(&self, listener: EventListener) {
        self.listeners.lock().push(listener);
    }

    fn emit(&self, event: SyncEvent) {
        for listener in self.listeners.lock().iter() {
            listener(&event);
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn status(&self) -> Result<SyncStatus> {
        let queue = ChangeQueue::new(&self.store);
        let stats = queue.stats()?;
        let conflicts = self.store.with_handle(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM sync_conflicts WHERE resolved_at IS NULL", [], |r| r.get(0))?;
            Ok(count as u64)
        })?;
        Ok(SyncStatus {
            online: self.online.load(Ordering::SeqCst),
            syncing: self.in_progress.load(Ordering::SeqCst),
            last_sync_time: *self.last_sync_time.lock(),
            pending_changes: stats.pending,
            conflicts,
        })
    }

    /// Run one sync cycle. Concurrent entrants are rejected (spec §4.E step
    /// 1: "reject concurrent entrants (return, do not queue)").
    #[instrument(skip(self))]
    pub async fn sync(&self) -> Result<()> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync already in progress, skipping reentry");
            return Ok(());
        }
        let result = self.run_cycle().await;
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn run_cycle(&self) -> Result<()> {
        let started_at = Instant::now();
        let queue = ChangeQueue::new(&self.store);
        let mut processed: u64 = 0;
        let total = queue.stats()?.pending;
        let mut push_failed = false;

        while processed < total {
            let batch = queue.pending(self.config.batch_size)?;
            if batch.is_empty() {
                break;
            }

            let envelopes: Vec<Value> = batch
                .iter()
                .map(|change| {
                    serde_json::json!({
                        "changeId": change.change_id,
                        "table": change.table.as_str(),
                        "rowId": change.row_id,
                        "operation": change.operation.as_str(),
                        "payload": change.payload,
                        "deviceId": change.device_id.to_string(),
                    })
                })
                .collect();

            let outcomes = match self.channel.send_batch(envelopes).await {
                Ok(outcomes) => outcomes,
                Err(err) => {
                    warn!(%err, "push batch failed, aborting cycle with rows left pending");
                    push_failed = true;
                    break;
                }
            };

            for (change, outcome) in batch.iter().zip(outcomes.iter()) {
                self.apply_outcome(&queue, change, outcome)?;
            }

            processed += batch.len() as u64;
            self.emit(SyncEvent::Progress { processed, total });
        }

        if push_failed {
            self.record_metric(SyncKind::Push, started_at, false)?;
            return Err(StoreError::TransportError("push batch failed".into()));
        }

        self.pull_remote_updates().await?;

        self.record_metric(SyncKind::FullSync, started_at, true)?;
        *self.last_sync_time.lock() = Some(Utc::now());
        let pending = queue.stats()?.pending;
        self.emit(SyncEvent::Complete { pending });
        info!(processed, pending, "sync cycle complete");
        Ok(())
    }

    fn apply_outcome(&self, queue: &ChangeQueue<'_>, change: &ChangeRecord, outcome: &ItemOutcome) -> Result<()> {
        if outcome.success {
            queue.mark_synced(change.change_id)?;
            return Ok(());
        }

        if outcome.conflict {
            let remote_version = outcome.remote_version.unwrap_or(0);
            return self.handle_conflict(queue, change, remote_version, outcome.remote_data.clone());
        }

        let message = outcome.error.clone().unwrap_or_else(|| "unknown error".into());
        queue.bump_retry(change.change_id, &message)?;
        Ok(())
    }

    fn handle_conflict(
        &self,
        queue: &ChangeQueue<'_>,
        change: &ChangeRecord,
        remote_version: u64,
        remote_data: Option<Value>,
    ) -> Result<()> {
        let remote_deleted = remote_data
            .as_ref()
            .and_then(|v| v.get("_deleted"))
            .and_then(Value::as_bool)
            == Some(true);
        let local = VersionedRecord {
            data: Some(change.payload.clone()),
            deleted_at: if matches!(change.operation, Operation::Delete) {
                Some(Utc::now())
            } else {
                None
            },
            modified_at: change.created_at,
            version: remote_version.max(1),
        };
        let remote = VersionedRecord {
            data: remote_data,
            deleted_at: if remote_deleted { Some(Utc::now()) } else { None },
            modified_at: Utc::now(),
            version: remote_version,
        };

        let resolved = resolver::resolve(&local, &remote, self.config.conflict_strategy);

        if resolved.resolution.is_auto_resolved() {
            self.apply_payload(change.table, &change.row_id, &resolved.payload)?;
            queue.mark_synced(change.change_id)?;
        } else {
            self.persist_conflict(change, &resolved)?;
            queue.bump_retry(change.change_id, "awaiting user decision")?;
            self.emit(SyncEvent::Conflict {
                table: change.table,
                row_id: change.row_id.clone(),
                kind: resolved.kind,
            });
        }
        Ok(())
    }

    fn persist_conflict(&self, change: &ChangeRecord, resolved: &resolver::ResolvedConflict) -> Result<()> {
        self.store.with_handle(|conn| {
            let now = Utc::now().to_rfc3339();
            let local_json = serde_json::to_string(&change.payload)?;
            let remote_json = serde_json::to_string(&resolved.payload)?;
            conn.execute(
                "INSERT INTO sync_conflicts(table_name, row_id, local_data, remote_data, kind, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    change.table.as_str(),
                    change.row_id,
                    local_json,
                    remote_json,
                    resolved.kind.as_str(),
                    now,
                ],
            )?;
            Ok(())
        })
    }

    async fn pull_remote_updates(&self) -> Result<()> {
        let last_sync = *self.last_sync_time.lock();
        let since = last_sync.unwrap_or_else(|| Utc::now() - chrono::Duration::days(3650));

        self.channel
            .send(WireMessage::PullUpdates {
                timestamp: Utc::now(),
                device_id: self.config.device_id,
                since,
            })
            .await?;

        // The response arrives asynchronously on the `pull-updates-response`
        // listener registered by `start_listening`, which routes it into
        // `apply_payload`; this call only issues the request side (spec
        // §4.E step 6 treats the round trip as part of one cycle, but the
        // channel's request/response pairing for non-batch messages is
        // fire-and-forget by design, matching `sendBatch` being the only
        // correlated request type in §6).
        Ok(())
    }

    /// Subscribe this engine to the channel's unsolicited update messages so
    /// remote changes are actually applied locally, not just pushed (spec
    /// §4.E, "applies inbound updates"). Call once per channel, typically
    /// from `DataLayer::start`.
    pub async fn start_listening(self: Arc<Self>) {
        let engine = self.clone();
        self.channel
            .subscribe(
                "pull-updates-response",
                Arc::new(move |msg: &WireMessage| {
                    if let WireMessage::PullUpdatesResponse { updates, .. } = msg {
                        engine.apply_remote_updates(updates.clone());
                    }
                }),
            )
            .await;

        let engine = self.clone();
        self.channel
            .subscribe(
                "server-update",
                Arc::new(move |msg: &WireMessage| {
                    if let WireMessage::ServerUpdate { payload, .. } = msg {
                        engine.apply_remote_updates(vec![payload.clone()]);
                    }
                }),
            )
            .await;
    }

    /// Apply a batch of remote update envelopes (`{table, rowId, payload}`
    /// each), skipping and logging any that don't parse rather than
    /// aborting the whole batch.
    fn apply_remote_updates(&self, updates: Vec<Value>) {
        for update in updates {
            let table = update.get("table").and_then(Value::as_str).and_then(|s| s.parse::<TableName>().ok());
            let row_id = update.get("rowId").and_then(Value::as_str);
            let payload = update.get("payload");
            match (table, row_id, payload) {
                (Some(table), Some(row_id), Some(payload)) => {
                    if let Err(err) = self.apply_payload(table, row_id, payload) {
                        warn!(%err, %table, row_id, "failed to apply remote update");
                    }
                }
                _ => warn!(?update, "remote update envelope missing table/rowId/payload"),
            }
        }
    }

    /// UPSERT on CREATE/UPDATE, soft-delete on DELETE (spec §4.E step 6).
    /// Invoked both from the resolver's auto-resolution path and from the
    /// `pull-updates-response` / `server-update` channel listeners
    /// registered by `start_listening`.
    pub fn apply_payload(&self, table: TableName, row_id: &str, payload: &Value) -> Result<()> {
        if payload.get("_deleted").and_then(Value::as_bool) == Some(true) {
            return self.soft_delete(table, row_id);
        }
        match table {
            TableName::Issues => self.upsert_issue(row_id, payload),
            TableName::Users => self.upsert_user(row_id, payload),
        }
    }

    fn soft_delete(&self, table: TableName, row_id: &str) -> Result<()> {
        self.store.with_handle(|conn| {
            let now = Utc::now().to_rfc3339();
            match table {
                TableName::Issues => {
                    conn.execute(
                        "UPDATE issues SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
                        params![now, row_id],
                    )?;
                }
                TableName::Users => {}
            }
            Ok(())
        })
    }

    fn upsert_issue(&self, row_id: &str, payload: &Value) -> Result<()> {
        let title = payload.get("title").and_then(Value::as_str).unwrap_or("untitled");
        let description = payload.get("description").and_then(Value::as_str);
        let status = payload.get("status").and_then(Value::as_str).unwrap_or("pending");
        let priority = payload.get("priority").and_then(Value::as_str).unwrap_or("medium");
        let assignee = payload.get("assignee").and_then(Value::as_str);
        let session_id = payload.get("sessionId").and_then(Value::as_str);
        let task_id = payload.get("taskId").and_then(Value::as_str);
        let completed_at = payload.get("completedAt").and_then(Value::as_str);
        let metadata = payload
            .get("metadata")
            .map(Value::to_string)
            .unwrap_or_else(|| "{}".to_string());
        let version = payload.get("version").and_then(Value::as_u64).unwrap_or(1) as i64;
        let device_id = payload
            .get("deviceId")
            .and_then(Value::as_str)
            .unwrap_or("00000000-0000-0000-0000-000000000000");

        self.store.with_handle(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO issues(id, title, description, status, priority, assignee, session_id, task_id,
                    created_at, updated_at, completed_at, version, locally_modified, metadata, device_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?10, ?11, 0, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title, description = excluded.description, status = excluded.status,
                    priority = excluded.priority, assignee = excluded.assignee, session_id = excluded.session_id,
                    task_id = excluded.task_id, updated_at = excluded.updated_at, completed_at = excluded.completed_at,
                    version = excluded.version, locally_modified = 0, metadata = excluded.metadata",
                params![
                    row_id, title, description, status, priority, assignee, session_id, task_id, now, completed_at,
                    version, metadata, device_id,
                ],
            )?;
            Ok(())
        })
    }

    fn upsert_user(&self, row_id: &str, payload: &Value) -> Result<()> {
        let display_name = payload.get("displayName").and_then(Value::as_str).unwrap_or("Unknown");
        let email = payload.get("email").and_then(Value::as_str);
        let device_id = payload
            .get("originDevice")
            .and_then(Value::as_str)
            .unwrap_or("00000000-0000-0000-0000-000000000000");

        self.store.with_handle(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO users(id, display_name, email, created_at, updated_at, origin_device)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    display_name = excluded.display_name, email = excluded.email, updated_at = excluded.updated_at",
                params![row_id, display_name, email, now, device_id],
            )?;
            Ok(())
        })
    }

    fn record_metric(&self, kind: SyncKind, started_at: Instant, success: bool) -> Result<()> {
        let latency_ms = started_at.elapsed().as_millis() as u64;
        self.metrics.record("sync", kind.as_str(), latency_ms as f64);
        self.store.with_handle(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO sync_metrics(device_id, kind, latency_ms, record_count, bytes_transferred, success, created_at)
                 VALUES (?1, ?2, ?3, 0, 0, ?4, ?5)",
                params![self.config.device_id.to_string(), kind.as_str(), latency_ms as i64, success as i64, now],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryHost;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn engine() -> (Arc<SyncEngine>, Arc<LocalStore>, crate::channel::LoopbackTransport) {
        let (engine, store, channel) = engine_with_channel();
        let (transport, _peer_tx, _peer_rx) = crate::channel::LoopbackTransport::pair();
        let _ = channel;
        (engine, store, transport)
    }

    fn engine_with_channel() -> (Arc<SyncEngine>, Arc<LocalStore>, DuplexChannel) {
        let store = Arc::new(LocalStore::open_in_memory(Arc::new(InMemoryHost::new())).unwrap());
        let config = StoreConfig::default();
        let channel = DuplexChannel::new(config.device_id, config.reconnect, config.heartbeat_interval);
        let metrics = MetricsCollector::new();
        let engine = Arc::new(SyncEngine::new(store.clone(), channel.clone(), metrics, config));
        (engine, store, channel)
    }

    #[tokio::test]
    async fn reentrant_sync_is_a_no_op() {
        let (engine, _store, _transport) = engine();
        engine.in_progress.store(true, Ordering::SeqCst);
        engine.sync().await.unwrap();
        assert!(engine.in_progress.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn sync_with_no_transport_connected_fails_cycle_when_changes_pending() {
        let (engine, store, _transport) = engine();
        let queue = ChangeQueue::new(&store);
        queue
            .enqueue(TableName::Issues, "i1", Operation::Create, &serde_json::json!({"title": "A"}), DeviceId::new())
            .unwrap();

        let sync = tokio::spawn(async move { engine.sync().await });
        tokio::time::advance(Duration::from_secs(31)).await;
        let result = sync.await.unwrap();
        assert!(result.is_err());
        assert_eq!(queue.stats().unwrap().pending, 1);
    }

    #[tokio::test]
    async fn apply_payload_upserts_issue() {
        let (engine, store, _transport) = engine();
        engine
            .apply_payload(TableName::Issues, "i1", &serde_json::json!({"title": "Hello", "version": 3}))
            .unwrap();

        store
            .with_handle(|conn| {
                let title: String = conn.query_row("SELECT title FROM issues WHERE id = 'i1'", [], |r| r.get(0))?;
                assert_eq!(title, "Hello");
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn start_listening_applies_server_update() {
        let (engine, store, channel) = engine_with_channel();
        engine.clone().start_listening().await;

        let (transport, peer_tx, _peer_rx) = crate::channel::LoopbackTransport::pair();
        channel.connect_with(Arc::new(transport)).await.unwrap();

        let msg = WireMessage::ServerUpdate {
            timestamp: Utc::now(),
            payload: serde_json::json!({"table": "issues", "rowId": "i1", "payload": {"title": "From server"}}),
        };
        peer_tx.send(serde_json::to_vec(&msg).unwrap()).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        store
            .with_handle(|conn| {
                let title: String = conn.query_row("SELECT title FROM issues WHERE id = 'i1'", [], |r| r.get(0))?;
                assert_eq!(title, "From server");
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn progress_events_fire_per_batch() {
        let (engine, store, _transport) = engine();
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        engine.on_event(Arc::new(move |event| {
            if matches!(event, SyncEvent::Progress { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        let _ = store;
        // With nothing queued, run_cycle's while loop never iterates.
        engine.sync().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
