use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Push,
    Pull,
    FullSync,
    Conflict,
}

impl SyncKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncKind::Push => "push",
            SyncKind::Pull => "pull",
            SyncKind::FullSync => "full_sync",
            SyncKind::Conflict => "conflict",
        }
    }
}

/// One row of `sync_metrics` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetric {
    pub device_id: DeviceId,
    pub kind: SyncKind,
    pub latency_ms: u64,
    pub record_count: u64,
    pub bytes_transferred: u64,
    pub success: bool,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// One row of `performance_metrics` (spec §3), written by the Metrics
/// Collector's periodic flush (§4.I).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub family: String,
    pub operation: String,
    pub value: f64,
    pub percentile: Option<String>,
    pub at: DateTime<Utc>,
    pub device_id: DeviceId,
}

/// One row of `cache_entries` (spec §3, §4.F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRow {
    pub key: String,
    pub payload: serde_json::Value,
    pub written_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl CacheRow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age_ms = (now - self.written_at).num_milliseconds().max(0) as u64;
        age_ms > self.ttl_ms
    }
}

/// A snapshot of the legacy store produced by the Migration Engine's backup
/// phase (spec §3, §4.H), pruned to a fixed rolling count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupBlob {
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub version_tag: String,
    pub byte_size: u64,
    pub compressed: bool,
    pub snapshot: Vec<u8>,
}
