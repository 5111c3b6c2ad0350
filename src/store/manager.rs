//! Local Store Manager (spec §4.A): owns the singleton handle to the
//! embedded SQL engine, runs migrations, and falls back to emergency mode.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{error, info, instrument, warn};

use super::emergency::EmergencyMode;
use super::health::{Health, HealthState};
use super::host::HostEnvironment;
use super::schema;
use crate::error::{Result, StoreError};

const MIN_FREE_FRACTION: f64 = 0.10;
const OPEN_RETRY_BACKOFFS: [Duration; 3] =
    [Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)];

/// Guards the one place in the crate allowed to hold a live SQLite
/// connection. Every other component reaches the engine through
/// [`LocalStore::handle`].
pub struct LocalStore {
    conn: Mutex<Option<Connection>>,
    ready: AtomicBool,
    emergency: EmergencyMode,
    host: Arc<dyn HostEnvironment>,
    path: StorePath,
}

enum StorePath {
    File(std::path::PathBuf),
    Memory,
}

impl LocalStore {
    /// Construct a manager that will open `path` on [`LocalStore::initialize`].
    pub fn new(path: impl AsRef<Path>, host: Arc<dyn HostEnvironment>) -> Self {
        Self {
            conn: Mutex::new(None),
            ready: AtomicBool::new(false),
            emergency: EmergencyMode::new(),
            host,
            path: StorePath::File(path.as_ref().to_path_buf()),
        }
    }

    /// Construct a manager over an in-memory SQLite database, for tests.
    pub fn open_in_memory(host: Arc<dyn HostEnvironment>) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(None),
            ready: AtomicBool::new(false),
            emergency: EmergencyMode::new(),
            host,
            path: StorePath::Memory,
        };
        store.initialize()?;
        Ok(store)
    }

    /// Idempotent initialization protocol (spec §4.A). Returns once the
    /// store is ready, or activates emergency mode and returns `Ok(())`
    /// regardless — callers observe degraded operation through
    /// [`LocalStore::health`], not through an `Err`.
    #[instrument(skip(self))]
    pub fn initialize(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Err(err) = self.try_initialize() {
            error!(%err, "local store initialization failed, entering emergency mode");
            self.emergency.activate(self.host.as_ref());
            self.emergency.spawn_periodic_serializer(self.host.clone());
            return Ok(());
        }

        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    fn try_initialize(&self) -> Result<()> {
        if !self.host.durable_store_present() {
            return Err(StoreError::StorageUnavailable);
        }

        let quota = self.host.quota_estimate()?;
        if quota.free_fraction() < MIN_FREE_FRACTION {
            return Err(StoreError::InsufficientStorage {
                free_fraction: quota.free_fraction(),
            });
        }

        let conn = self.open_with_retry()?;
        schema::apply(&conn).map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

        if self.emergency.is_active() {
            self.ingest_emergency_backup(&conn)?;
            self.emergency.deactivate();
        }

        *self.conn.lock() = Some(conn);
        info!("local store ready");
        Ok(())
    }

    fn open_with_retry(&self) -> Result<Connection> {
        let mut last_err = None;
        for (attempt, backoff) in std::iter::once(Duration::ZERO)
            .chain(OPEN_RETRY_BACKOFFS)
            .enumerate()
        {
            if attempt > 0 {
                warn!(attempt, ?backoff, "retrying store open");
                std::thread::sleep(backoff);
            }
            let opened = match &self.path {
                StorePath::File(p) => Connection::open(p),
                StorePath::Memory => Connection::open_in_memory(),
            };
            match opened {
                Ok(conn) => return Ok(conn),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.expect("at least one attempt was made").into())
    }

    /// Recover rows accumulated in the emergency engine into the
    /// freshly-opened durable one (spec §4.A step 6).
    fn ingest_emergency_backup(&self, conn: &Connection) -> Result<()> {
        self.emergency.recover_into(conn)?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO health_checks(key, value, updated_at) VALUES ('emergency_recovered', '1', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![now],
        )?;
        Ok(())
    }

    /// Run `f` against the live connection, or against the emergency
    /// engine's connection while emergency mode is active, so every caller
    /// that routes through here (queue, cache, quota, metrics, migration,
    /// sync) keeps working in degraded mode instead of failing outright.
    /// `less-db`'s `Adapter` uses the same run-a-closure-under-the-lock
    /// shape for its `transaction` method.
    pub fn with_handle<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        if self.emergency.is_active() {
            return self.emergency.with_conn(f);
        }
        if !self.ready.load(Ordering::Acquire) {
            return Err(StoreError::NotReady("local store not initialized".into()));
        }
        let guard = self.conn.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| StoreError::NotReady("local store handle unavailable".into()))?;
        f(conn)
    }

    pub fn health(&self) -> Health {
        if self.emergency.is_active() {
            return Health {
                state: HealthState::Emergency,
                details: "operating against the in-memory emergency engine".to_string(),
                checked_at: Utc::now(),
            };
        }
        if !self.ready.load(Ordering::Acquire) {
            return Health {
                state: HealthState::Degraded,
                details: "store not yet initialized".to_string(),
                checked_at: Utc::now(),
            };
        }
        let guard = self.conn.lock();
        match guard.as_ref() {
            Some(conn) => match conn.execute_batch("SELECT 1") {
                Ok(()) => Health {
                    state: HealthState::Healthy,
                    details: "ok".to_string(),
                    checked_at: Utc::now(),
                },
                Err(err) => Health {
                    state: HealthState::Degraded,
                    details: err.to_string(),
                    checked_at: Utc::now(),
                },
            },
            None => Health {
                state: HealthState::Degraded,
                details: "no connection held".to_string(),
                checked_at: Utc::now(),
            },
        }
    }

    /// Close the connection and wipe in-memory state. Used by tests and by
    /// the host when it wants a clean-slate store.
    pub fn reset(&self) {
        *self.conn.lock() = None;
        self.ready.store(false, Ordering::Release);
        self.emergency.deactivate();
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.is_active()
    }

    pub fn emergency(&self) -> &EmergencyMode {
        &self.emergency
    }

    pub fn host(&self) -> &Arc<dyn HostEnvironment> {
        &self.host
    }
}
