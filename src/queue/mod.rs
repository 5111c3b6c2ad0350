//! Change Queue (spec §4.B): an append-only table in the local store plus
//! helpers for draining, retrying, and dead-lettering.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::LocalStore;
use crate::types::{ChangeId, ChangeRecord, DeviceId, Operation, TableName};

/// Retry budget: a row reaching this count is dead-lettered and excluded
/// from future cycles (spec §4.B, §4.E, §8 boundary behavior).
pub const MAX_RETRIES: u32 = 5;

/// Base backoff for scheduled retries: `5s * 2^(retries-1)` (spec §4.B).
const RETRY_BASE: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub pending: u64,
    pub synced: u64,
    pub dead: u64,
    pub total: u64,
}

pub struct ChangeQueue<'a> {
    store: &'a LocalStore,
}

impl<'a> ChangeQueue<'a> {
    pub fn new(store: &'a LocalStore) -> Self {
        Self { store }
    }

    /// Insert or coalesce a mutation (spec §4.B). If an unsynced row already
    /// exists for `(table, row_id)`, its operation/payload are overwritten
    /// and its retry counter is reset — enforced here in application logic
    /// and backstopped by the `idx_sync_queue_unsynced_unique` index.
    pub fn enqueue(
        &self,
        table: TableName,
        row_id: &str,
        operation: Operation,
        payload: &serde_json::Value,
        device_id: DeviceId,
    ) -> Result<ChangeId> {
        self.store.with_handle(|conn| {
            let existing: Option<ChangeId> = conn
                .query_row(
                    "SELECT change_id FROM sync_queue WHERE table_name = ?1 AND row_id = ?2 AND synced_at IS NULL",
                    params![table.as_str(), row_id],
                    |row| row.get(0),
                )
                .optional()?;

            let payload_json = serde_json::to_string(payload)?;
            let now = Utc::now().to_rfc3339();

            if let Some(change_id) = existing {
                conn.execute(
                    "UPDATE sync_queue SET operation = ?1, payload = ?2, retries = 0, last_error = NULL,
                         next_retry_at = NULL, device_id = ?3, created_at = ?4
                     WHERE change_id = ?5",
                    params![operation.as_str(), payload_json, device_id.to_string(), now, change_id],
                )?;
                debug!(change_id, "coalesced change into existing queue row");
                Ok(change_id)
            } else {
                conn.execute(
                    "INSERT INTO sync_queue(table_name, row_id, operation, payload, device_id, created_at, retries)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                    params![table.as_str(), row_id, operation.as_str(), payload_json, device_id.to_string(), now],
                )?;
                Ok(conn.last_insert_rowid())
            }
        })
    }

    /// Up to `limit` unsynced, not-dead rows, ordered by creation (spec
    /// §4.B, §4.E drain order).
    pub fn pending(&self, limit: usize) -> Result<Vec<ChangeRecord>> {
        self.store.with_handle(|conn| {
            let mut stmt = conn.prepare(
                "SELECT change_id, table_name, row_id, operation, payload, device_id, created_at,
                        synced_at, retries, last_error, next_retry_at
                 FROM sync_queue
                 WHERE synced_at IS NULL AND retries < ?1
                 ORDER BY created_at ASC, change_id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![MAX_RETRIES, limit as i64], row_to_change)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn mark_synced(&self, change_id: ChangeId) -> Result<()> {
        self.store.with_handle(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sync_queue SET synced_at = ?1 WHERE change_id = ?2",
                params![now, change_id],
            )?;
            Ok(())
        })
    }

    /// Increment the retry counter and record the error. Below
    /// [`MAX_RETRIES`], schedules a future retry with exponential backoff;
    /// at [`MAX_RETRIES`] the row is left dead (spec §4.B, §8 boundary
    /// behavior: `retries == 4` at failure time transitions to dead, not a
    /// further retry).
    pub fn bump_retry(&self, change_id: ChangeId, error: &str) -> Result<()> {
        self.store.with_handle(|conn| {
            let retries: u32 = conn.query_row(
                "SELECT retries FROM sync_queue WHERE change_id = ?1",
                params![change_id],
                |row| row.get(0),
            )?;
            let next_retries = retries + 1;
            let next_retry_at = if next_retries < MAX_RETRIES {
                let backoff = RETRY_BASE * 2u32.pow(next_retries.saturating_sub(1));
                Some((Utc::now() + ChronoDuration::from_std(backoff).unwrap()).to_rfc3339())
            } else {
                warn!(change_id, "change dead-lettered after exhausting retries");
                None
            };
            conn.execute(
                "UPDATE sync_queue SET retries = ?1, last_error = ?2, next_retry_at = ?3 WHERE change_id = ?4",
                params![next_retries, error, next_retry_at, change_id],
            )?;
            Ok(())
        })
    }

    /// Reset a dead-lettered row so it is eligible for the next cycle again.
    pub fn retry_dead(&self, change_id: ChangeId) -> Result<()> {
        self.store.with_handle(|conn| {
            conn.execute(
                "UPDATE sync_queue SET retries = 0, last_error = NULL, next_retry_at = NULL WHERE change_id = ?1",
                params![change_id],
            )?;
            Ok(())
        })
    }

    /// Delete synced rows older than `older_than_days`.
    pub fn prune(&self, older_than_days: i64) -> Result<u64> {
        self.store.with_handle(|conn| {
            let threshold = (Utc::now() - ChronoDuration::days(older_than_days)).to_rfc3339();
            let deleted = conn.execute(
                "DELETE FROM sync_queue WHERE synced_at IS NOT NULL AND synced_at < ?1",
                params![threshold],
            )?;
            Ok(deleted as u64)
        })
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.store.with_handle(|conn| {
            let pending: u64 = conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE synced_at IS NULL AND retries < ?1",
                params![MAX_RETRIES],
                |r| r.get(0),
            )?;
            let dead: u64 = conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE synced_at IS NULL AND retries >= ?1",
                params![MAX_RETRIES],
                |r| r.get(0),
            )?;
            let synced: u64 =
                conn.query_row("SELECT COUNT(*) FROM sync_queue WHERE synced_at IS NOT NULL", [], |r| {
                    r.get(0)
                })?;
            let total: u64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |r| r.get(0))?;
            Ok(QueueStats {
                pending,
                synced,
                dead,
                total,
            })
        })
    }
}

fn row_to_change(row: &Row<'_>) -> rusqlite::Result<ChangeRecord> {
    let table_str: String = row.get(1)?;
    let op_str: String = row.get(3)?;
    let payload_str: String = row.get(4)?;
    let device_str: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let synced_at: Option<String> = row.get(7)?;
    let next_retry_at: Option<String> = row.get(10)?;

    Ok(ChangeRecord {
        change_id: row.get(0)?,
        table: table_str
            .parse()
            .map_err(|_| sql_err("table_name"))?,
        row_id: row.get(2)?,
        operation: op_str.parse().map_err(|_| sql_err("operation"))?,
        payload: serde_json::from_str(&payload_str).map_err(|_| sql_err("payload"))?,
        device_id: DeviceId(device_str.parse().map_err(|_| sql_err("device_id"))?),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|_| sql_err("created_at"))?
            .with_timezone(&Utc),
        synced_at: synced_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .map_err(|_| sql_err("synced_at"))?,
        retries: row.get(8)?,
        last_error: row.get(9)?,
        next_retry_at: next_retry_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .map_err(|_| sql_err("next_retry_at"))?,
    })
}

fn sql_err(column: &'static str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnName(column.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::InMemoryHost;

    fn setup() -> LocalStore {
        LocalStore::open_in_memory(Arc::new(InMemoryHost::new())).unwrap()
    }

    #[test]
    fn enqueue_then_pending() {
        let store = setup();
        let queue = ChangeQueue::new(&store);
        let device = DeviceId::new();
        queue
            .enqueue(
                TableName::Issues,
                "i1",
                Operation::Create,
                &serde_json::json!({"title": "A"}),
                device,
            )
            .unwrap();

        let pending = queue.pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].row_id, "i1");
    }

    #[test]
    fn coalesces_repeated_mutations() {
        let store = setup();
        let queue = ChangeQueue::new(&store);
        let device = DeviceId::new();
        queue
            .enqueue(TableName::Issues, "i1", Operation::Create, &serde_json::json!({}), device)
            .unwrap();
        queue
            .enqueue(
                TableName::Issues,
                "i1",
                Operation::Update,
                &serde_json::json!({"title": "B"}),
                device,
            )
            .unwrap();

        let pending = queue.pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation.as_str(), "UPDATE");
    }

    #[test]
    fn mark_synced_excludes_from_pending() {
        let store = setup();
        let queue = ChangeQueue::new(&store);
        let id = queue
            .enqueue(TableName::Issues, "i1", Operation::Create, &serde_json::json!({}), DeviceId::new())
            .unwrap();
        queue.mark_synced(id).unwrap();
        assert!(queue.pending(10).unwrap().is_empty());
        assert_eq!(queue.stats().unwrap().synced, 1);
    }

    #[test]
    fn retry_exhaustion_dead_letters_row() {
        let store = setup();
        let queue = ChangeQueue::new(&store);
        let id = queue
            .enqueue(TableName::Issues, "i1", Operation::Create, &serde_json::json!({}), DeviceId::new())
            .unwrap();

        for _ in 0..MAX_RETRIES {
            queue.bump_retry(id, "boom").unwrap();
        }

        assert!(queue.pending(10).unwrap().is_empty());
        assert_eq!(queue.stats().unwrap().dead, 1);

        queue.retry_dead(id).unwrap();
        assert_eq!(queue.pending(10).unwrap().len(), 1);
    }

    #[test]
    fn prune_removes_only_old_synced_rows() {
        let store = setup();
        let queue = ChangeQueue::new(&store);
        let id = queue
            .enqueue(TableName::Issues, "i1", Operation::Create, &serde_json::json!({}), DeviceId::new())
            .unwrap();
        queue.mark_synced(id).unwrap();

        let pruned = queue.prune(30).unwrap();
        assert_eq!(pruned, 0);
        assert_eq!(queue.stats().unwrap().total, 1);
    }
}
