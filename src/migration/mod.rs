//! Migration Engine (spec §4.H): one-shot, resumable transfer from a legacy
//! flat key-value blob store into the embedded SQL engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::error::{Result, StoreError};
use crate::store::{HostEnvironment, LocalStore};

const CHECKPOINT_KEY: &str = "migration_state";
const COMPLETED_KEY: &str = "migration_completed";
const BACKUP_RETENTION: i64 = 3;

/// A legacy record store the engine migrates out of. Production hosts wrap
/// their own key-value slots; tests use [`InMemoryLegacySource`].
pub trait LegacySource: Send + Sync {
    fn user_count(&self) -> Result<u64>;
    fn issue_count(&self) -> Result<u64>;
    /// Returns `None` once `index` is past the end (unbatched iteration).
    fn user_at(&self, index: u64) -> Result<Option<Value>>;
    fn issues_batch(&self, offset: u64, limit: u64) -> Result<Vec<Value>>;
    /// The entire legacy blob, for the backup phase.
    fn serialize_all(&self) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Analyze,
    Validate,
    MigrateUsers,
    MigrateIssues,
    Verify,
    Backup,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationCheckpoint {
    pub phase: MigrationPhase,
    pub users_completed: u64,
    pub last_processed_user_index: u64,
    pub issues_completed: u64,
    pub last_processed_issue_index: u64,
    pub total_users: u64,
    pub total_issues: u64,
}

impl Default for MigrationCheckpoint {
    fn default() -> Self {
        Self {
            phase: MigrationPhase::Analyze,
            users_completed: 0,
            last_processed_user_index: 0,
            issues_completed: 0,
            last_processed_issue_index: 0,
            total_users: 0,
            total_issues: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationProgress {
    pub current_step: MigrationPhase,
    pub total_records: u64,
    pub processed_records: u64,
    pub percent_complete: f64,
    pub estimated_time: std::time::Duration,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlSignal {
    Run,
    Pause,
    Cancel,
}

type ProgressListener = Arc<dyn Fn(&MigrationProgress) + Send + Sync>;
type ErrorListener = Arc<dyn Fn(&StoreError) + Send + Sync>;
type CompleteListener = Arc<dyn Fn() + Send + Sync>;

/// Orchestrates the analyze → validate → migrate-users → migrate-issues →
/// verify → backup pipeline (spec §4.H).
pub struct MigrationEngine {
    store: Arc<LocalStore>,
    legacy: Arc<dyn LegacySource>,
    config: MigrationConfig,
    paused: AtomicBool,
    cancelled: AtomicBool,
    errors: Mutex<Vec<String>>,
    on_progress: Mutex<Vec<ProgressListener>>,
    on_error: Mutex<Vec<ErrorListener>>,
    on_complete: Mutex<Vec<CompleteListener>>,
}

impl MigrationEngine {
    pub fn new(store: Arc<LocalStore>, legacy: Arc<dyn LegacySource>, config: MigrationConfig) -> Self {
        Self {
            store,
            legacy,
            config,
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
            on_progress: Mutex::new(Vec::new()),
            on_error: Mutex::new(Vec::new()),
            on_complete: Mutex::new(Vec::new()),
        }
    }

    pub fn on_progress(&self, listener: ProgressListener) {
        self.on_progress.lock().push(listener);
    }

    pub fn on_error(&self, listener: ErrorListener) {
        self.on_error.lock().push(listener);
    }

    pub fn on_complete(&self, listener: CompleteListener) {
        self.on_complete.lock().push(listener);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn checkpoint(&self) -> Result<MigrationCheckpoint> {
        match self.store.host().kv_get(CHECKPOINT_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(MigrationCheckpoint::default()),
        }
    }

    fn persist_checkpoint(&self, checkpoint: &MigrationCheckpoint) -> Result<()> {
        let raw = serde_json::to_string(checkpoint)?;
        self.store.host().kv_set(CHECKPOINT_KEY, &raw)
    }

    fn signal(&self) -> ControlSignal {
        if self.cancelled.load(Ordering::SeqCst) {
            ControlSignal::Cancel
        } else if self.paused.load(Ordering::SeqCst) {
            ControlSignal::Pause
        } else {
            ControlSignal::Run
        }
    }

    fn emit_progress(&self, checkpoint: &MigrationCheckpoint, started_at: std::time::Instant) {
        let total = checkpoint.total_users + checkpoint.total_issues;
        let processed = checkpoint.users_completed + checkpoint.issues_completed;
        let percent_complete = if total == 0 { 100.0 } else { processed as f64 / total as f64 * 100.0 };
        let elapsed = started_at.elapsed();
        let estimated_time = if processed == 0 {
            std::time::Duration::ZERO
        } else {
            let per_record = elapsed.as_secs_f64() / processed as f64;
            std::time::Duration::from_secs_f64(per_record * (total.saturating_sub(processed)) as f64)
        };
        let progress = MigrationProgress {
            current_step: checkpoint.phase,
            total_records: total,
            processed_records: processed,
            percent_complete,
            estimated_time,
            errors: self.errors.lock().clone(),
        };
        for listener in self.on_progress.lock().iter() {
            listener(&progress);
        }
    }

    fn record_record_error(&self, message: String) {
        warn!(%message, "migration record error");
        self.errors.lock().push(message);
    }

    fn fail(&self, err: StoreError) -> StoreError {
        error!(%err, "migration engine-level failure");
        for listener in self.on_error.lock().iter() {
            listener(&err);
        }
        err
    }

    /// Run the migration from wherever the checkpoint left off (spec §4.H
    /// "Resumability"). Returns `Ok(())` on completion, pause, or cancel;
    /// engine-level errors are surfaced both as `Err` and via `on_error`.
    pub async fn migrate(&self) -> Result<()> {
        if self.store.host().kv_get(COMPLETED_KEY)?.is_some() {
            return Ok(());
        }

        let started_at = std::time::Instant::now();
        let mut checkpoint = self.checkpoint()?;

        loop {
            if self.signal() == ControlSignal::Cancel {
                info!("migration cancelled, checkpoint retained");
                return Ok(());
            }
            if self.signal() == ControlSignal::Pause {
                info!(phase = ?checkpoint.phase, "migration paused at checkpoint");
                return Ok(());
            }

            match checkpoint.phase {
                MigrationPhase::Analyze => {
                    checkpoint.total_users = self.legacy.user_count()?;
                    checkpoint.total_issues = self.legacy.issue_count()?;
                    checkpoint.phase = MigrationPhase::Validate;
                }
                MigrationPhase::Validate => {
                    self.validate()
                        .map_err(|e| self.fail(StoreError::MigrationValidationError(e.to_string())))?;
                    checkpoint.phase = MigrationPhase::MigrateUsers;
                }
                MigrationPhase::MigrateUsers => {
                    self.migrate_users(&mut checkpoint)?;
                    checkpoint.phase = MigrationPhase::MigrateIssues;
                }
                MigrationPhase::MigrateIssues => {
                    self.migrate_issues(&mut checkpoint).await?;
                    checkpoint.phase = MigrationPhase::Verify;
                }
                MigrationPhase::Verify => {
                    self.verify(&checkpoint)
                        .map_err(|e| self.fail(StoreError::MigrationFailed(e.to_string())))?;
                    checkpoint.phase = MigrationPhase::Backup;
                }
                MigrationPhase::Backup => {
                    self.backup()?;
                    checkpoint.phase = MigrationPhase::Complete;
                }
                MigrationPhase::Complete => {
                    self.persist_checkpoint(&checkpoint)?;
                    self.store.host().kv_set(COMPLETED_KEY, "1")?;
                    self.emit_progress(&checkpoint, started_at);
                    for listener in self.on_complete.lock().iter() {
                        listener();
                    }
                    info!("migration complete");
                    return Ok(());
                }
            }

            self.persist_checkpoint(&checkpoint)?;
            self.emit_progress(&checkpoint, started_at);
        }
    }

    fn validate(&self) -> Result<()> {
        let user_count = self.legacy.user_count()?;
        let mut known_user_ids = std::collections::HashSet::new();
        for i in 0..user_count {
            if let Some(user) = self.legacy.user_at(i)? {
                if user.get("id").and_then(Value::as_str).is_none() {
                    return Err(StoreError::MigrationValidationError(format!(
                        "legacy user at index {i} is missing required field id"
                    )));
                }
                if let Some(id) = user.get("id").and_then(Value::as_str) {
                    known_user_ids.insert(id.to_string());
                }
            }
        }

        let issue_count = self.legacy.issue_count()?;
        let issues = self.legacy.issues_batch(0, issue_count)?;
        for issue in &issues {
            if issue.get("title").and_then(Value::as_str).map(str::is_empty).unwrap_or(true) {
                return Err(StoreError::MigrationValidationError(
                    "legacy issue missing required field title".into(),
                ));
            }
            if let Some(assignee) = issue.get("assignee").and_then(Value::as_str) {
                if !known_user_ids.contains(assignee) {
                    return Err(StoreError::MigrationValidationError(format!(
                        "legacy issue references unknown assignee {assignee}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn migrate_users(&self, checkpoint: &mut MigrationCheckpoint) -> Result<()> {
        while checkpoint.last_processed_user_index < checkpoint.total_users {
            let index = checkpoint.last_processed_user_index;
            match self.legacy.user_at(index) {
                Ok(Some(raw)) => {
                    if let Err(err) = self.insert_legacy_user(&raw) {
                        self.record_record_error(format!("user {index}: {err}"));
                    } else {
                        checkpoint.users_completed += 1;
                    }
                }
                Ok(None) => {}
                Err(err) => self.record_record_error(format!("user {index}: {err}")),
            }
            checkpoint.last_processed_user_index += 1;
        }
        Ok(())
    }

    fn insert_legacy_user(&self, raw: &Value) -> Result<()> {
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::MigrationValidationError("user missing id".into()))?;
        let display_name = raw.get("displayName").and_then(Value::as_str).unwrap_or("Unknown");
        let email = raw.get("email").and_then(Value::as_str);
        let now = Utc::now().to_rfc3339();
        let device_id = raw
            .get("originDevice")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.store.with_handle(|conn| {
            conn.execute(
                "INSERT INTO users(id, display_name, email, created_at, updated_at, last_sync_at, origin_device)
                 VALUES (?1, ?2, ?3, ?4, ?4, NULL, ?5)
                 ON CONFLICT(id) DO NOTHING",
                params![id, display_name, email, now, device_id],
            )?;
            Ok(())
        })
    }

    async fn migrate_issues(&self, checkpoint: &mut MigrationCheckpoint) -> Result<()> {
        let batch_size = self.config.batch_size as u64;
        while checkpoint.last_processed_issue_index < checkpoint.total_issues {
            if self.signal() != ControlSignal::Run {
                return Ok(());
            }
            let offset = checkpoint.last_processed_issue_index;
            let batch = self.legacy.issues_batch(offset, batch_size)?;
            if batch.is_empty() {
                break;
            }
            for (i, raw) in batch.iter().enumerate() {
                if let Err(err) = self.insert_legacy_issue(raw) {
                    self.record_record_error(format!("issue {}: {err}", offset + i as u64));
                } else {
                    checkpoint.issues_completed += 1;
                }
            }
            checkpoint.last_processed_issue_index += batch.len() as u64;
            self.persist_checkpoint(checkpoint)?;
            tokio::time::sleep(self.config.inter_batch_delay).await;
        }
        Ok(())
    }

    fn insert_legacy_issue(&self, raw: &Value) -> Result<()> {
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let title = raw
            .get("title")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::MigrationValidationError("issue missing title".into()))?;
        let status = raw.get("status").and_then(Value::as_str).unwrap_or("pending");
        let priority = raw.get("priority").and_then(Value::as_str).unwrap_or("medium");
        let assignee = raw.get("assignee").and_then(Value::as_str);
        let now = Utc::now().to_rfc3339();
        let device_id = raw
            .get("deviceId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.store.with_handle(|conn| {
            conn.execute(
                "INSERT INTO issues(id, title, description, status, priority, assignee, created_at, updated_at, version, locally_modified, device_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 1, 0, ?8)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    id,
                    title,
                    raw.get("description").and_then(Value::as_str),
                    status,
                    priority,
                    assignee,
                    now,
                    device_id,
                ],
            )?;
            Ok(())
        })
    }

    fn verify(&self, checkpoint: &MigrationCheckpoint) -> Result<()> {
        let (users, issues) = self.store.with_handle(|conn| {
            let users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
            let issues: i64 = conn.query_row("SELECT COUNT(*) FROM issues", [], |r| r.get(0))?;
            Ok((users as u64, issues as u64))
        })?;

        if users < checkpoint.users_completed || issues < checkpoint.issues_completed {
            return Err(StoreError::MigrationFailed(format!(
                "verification mismatch: expected at least {}/{} rows, found {users}/{issues}",
                checkpoint.users_completed, checkpoint.issues_completed
            )));
        }
        Ok(())
    }

    fn backup(&self) -> Result<()> {
        let snapshot = self.legacy.serialize_all()?;
        let backup_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        self.store.with_handle(|conn| {
            conn.execute(
                "INSERT INTO backups(backup_id, created_at, version_tag, byte_size, compressed, snapshot)
                 VALUES (?1, ?2, 'legacy-v1', ?3, 0, ?4)",
                params![backup_id, now, snapshot.len() as i64, snapshot],
            )?;
            conn.execute(
                "DELETE FROM backups WHERE backup_id NOT IN (
                    SELECT backup_id FROM backups ORDER BY created_at DESC LIMIT ?1
                )",
                params![BACKUP_RETENTION],
            )?;
            Ok(())
        })
    }
}

/// An in-memory [`LegacySource`], for tests.
#[derive(Default)]
pub struct InMemoryLegacySource {
    pub users: Vec<Value>,
    pub issues: Vec<Value>,
}

impl LegacySource for InMemoryLegacySource {
    fn user_count(&self) -> Result<u64> {
        Ok(self.users.len() as u64)
    }

    fn issue_count(&self) -> Result<u64> {
        Ok(self.issues.len() as u64)
    }

    fn user_at(&self, index: u64) -> Result<Option<Value>> {
        Ok(self.users.get(index as usize).cloned())
    }

    fn issues_batch(&self, offset: u64, limit: u64) -> Result<Vec<Value>> {
        let start = offset as usize;
        let end = (start + limit as usize).min(self.issues.len());
        if start >= self.issues.len() {
            return Ok(Vec::new());
        }
        Ok(self.issues[start..end].to_vec())
    }

    fn serialize_all(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&serde_json::json!({
            "users": self.users,
            "issues": self.issues,
        }))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryHost;
    use serde_json::json;

    fn engine_with(users: Vec<Value>, issues: Vec<Value>) -> (Arc<MigrationEngine>, Arc<LocalStore>) {
        let host = Arc::new(InMemoryHost::new());
        let store = Arc::new(LocalStore::open_in_memory(host).unwrap());
        let legacy = Arc::new(InMemoryLegacySource { users, issues });
        let engine = Arc::new(MigrationEngine::new(store.clone(), legacy, MigrationConfig::default()));
        (engine, store)
    }

    #[tokio::test]
    async fn migrates_users_and_issues_end_to_end() {
        let (engine, store) = engine_with(
            vec![json!({"id": "u1", "displayName": "Ada"})],
            vec![json!({"id": "i1", "title": "Ship it", "assignee": "u1"})],
        );
        engine.migrate().await.unwrap();

        store
            .with_handle(|conn| {
                let users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
                let issues: i64 = conn.query_row("SELECT COUNT(*) FROM issues", [], |r| r.get(0))?;
                assert_eq!(users, 1);
                assert_eq!(issues, 1);
                Ok(())
            })
            .unwrap();
        assert!(store.host().kv_get(COMPLETED_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn rejects_issue_with_unknown_assignee() {
        let (engine, _store) = engine_with(
            vec![json!({"id": "u1", "displayName": "Ada"})],
            vec![json!({"id": "i1", "title": "Ship it", "assignee": "ghost"})],
        );
        let err = engine.migrate().await.unwrap_err();
        assert!(matches!(err, StoreError::MigrationValidationError(_)));
    }

    #[tokio::test]
    async fn second_call_after_completion_is_a_no_op() {
        let (engine, _store) = engine_with(vec![json!({"id": "u1", "displayName": "Ada"})], vec![]);
        engine.migrate().await.unwrap();
        engine.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn pause_stops_before_completion_and_resume_finishes() {
        let (engine, store) = engine_with(
            vec![json!({"id": "u1", "displayName": "Ada"})],
            vec![json!({"id": "i1", "title": "Ship it"})],
        );
        engine.pause();
        engine.migrate().await.unwrap();
        assert!(store.host().kv_get(COMPLETED_KEY).unwrap().is_none());

        engine.resume();
        engine.migrate().await.unwrap();
        assert!(store.host().kv_get(COMPLETED_KEY).unwrap().is_some());
    }
}
