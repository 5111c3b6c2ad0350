//! The host-runtime contract (spec §6, "Persisted state layout (outside A)").
//!
//! The source runs inside a browser; this crate models the browser's durable
//! object store, key-value slots, and storage estimator as a trait the host
//! application implements, the same way the teacher pack pushes networking
//! out to a user-supplied `SyncTransport`. An in-memory implementation is
//! provided for tests and for emergency-mode bootstrapping.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// A point-in-time read of the host's storage estimator.
#[derive(Debug, Clone, Copy)]
pub struct QuotaEstimate {
    pub used_bytes: u64,
    pub quota_bytes: u64,
}

impl QuotaEstimate {
    pub fn percent_used(self) -> f64 {
        if self.quota_bytes == 0 {
            return 1.0;
        }
        self.used_bytes as f64 / self.quota_bytes as f64
    }

    pub fn free_fraction(self) -> f64 {
        1.0 - self.percent_used()
    }
}

/// Everything the core needs from the host runtime outside of the embedded
/// SQL engine: a durable-object-store presence check, a storage quota
/// estimator, and a handful of named key-value slots (`deviceId`,
/// `migration_completed`, `migration_state`, `conflictResolution`,
/// `emergency_backup`, `backup_*`).
pub trait HostEnvironment: Send + Sync {
    /// Whether the host exposes a durable object store at all (step 1 of
    /// the initialization protocol).
    fn durable_store_present(&self) -> bool;

    /// Probe free/used quota (step 2 of the initialization protocol, and
    /// the Quota Manager's periodic probe).
    fn quota_estimate(&self) -> Result<QuotaEstimate>;

    fn kv_get(&self, key: &str) -> Result<Option<String>>;
    fn kv_set(&self, key: &str, value: &str) -> Result<()>;
    fn kv_remove(&self, key: &str) -> Result<()>;
}

/// An in-memory [`HostEnvironment`], used by tests and as the fallback
/// backing store for emergency mode.
#[derive(Clone, Default)]
pub struct InMemoryHost {
    inner: Arc<Mutex<HashMap<String, String>>>,
    present: bool,
    quota: Option<QuotaEstimate>,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            present: true,
            quota: Some(QuotaEstimate {
                used_bytes: 0,
                quota_bytes: 1_000_000_000,
            }),
        }
    }

    pub fn absent() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            present: false,
            quota: None,
        }
    }

    pub fn with_quota(mut self, used_bytes: u64, quota_bytes: u64) -> Self {
        self.quota = Some(QuotaEstimate {
            used_bytes,
            quota_bytes,
        });
        self
    }
}

impl HostEnvironment for InMemoryHost {
    fn durable_store_present(&self) -> bool {
        self.present
    }

    fn quota_estimate(&self) -> Result<QuotaEstimate> {
        Ok(self.quota.unwrap_or(QuotaEstimate {
            used_bytes: 0,
            quota_bytes: 1_000_000_000,
        }))
    }

    fn kv_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().get(key).cloned())
    }

    fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn kv_remove(&self, key: &str) -> Result<()> {
        self.inner.lock().remove(key);
        Ok(())
    }
}
