//! Wire protocol (spec §6): every message is `{ type, payload?, timestamp,
//! deviceId? }`. Represented as a tagged enum so that serialization always
//! produces the `type` discriminator the server expects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::DeviceId;

/// Client→Server and Server→Client message bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "ping")]
    Ping { timestamp: DateTime<Utc> },
    #[serde(rename = "pong")]
    Pong { timestamp: DateTime<Utc> },
    #[serde(rename = "sync-change")]
    SyncChange {
        timestamp: DateTime<Utc>,
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        payload: Value,
    },
    #[serde(rename = "batch")]
    Batch {
        timestamp: DateTime<Utc>,
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        #[serde(rename = "batchId")]
        batch_id: u64,
        messages: Vec<Value>,
    },
    #[serde(rename = "batch-response")]
    BatchResponse {
        timestamp: DateTime<Utc>,
        #[serde(rename = "batchId")]
        batch_id: u64,
        results: Vec<ItemOutcome>,
    },
    #[serde(rename = "pull-updates")]
    PullUpdates {
        timestamp: DateTime<Utc>,
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        since: DateTime<Utc>,
    },
    #[serde(rename = "pull-updates-response")]
    PullUpdatesResponse {
        timestamp: DateTime<Utc>,
        updates: Vec<Value>,
    },
    #[serde(rename = "server-update")]
    ServerUpdate { timestamp: DateTime<Utc>, payload: Value },
    #[serde(rename = "conflict")]
    Conflict { timestamp: DateTime<Utc>, payload: Value },
}

impl WireMessage {
    pub fn type_tag(&self) -> &'static str {
        match self {
            WireMessage::Ping { .. } => "ping",
            WireMessage::Pong { .. } => "pong",
            WireMessage::SyncChange { .. } => "sync-change",
            WireMessage::Batch { .. } => "batch",
            WireMessage::BatchResponse { .. } => "batch-response",
            WireMessage::PullUpdates { .. } => "pull-updates",
            WireMessage::PullUpdatesResponse { .. } => "pull-updates-response",
            WireMessage::ServerUpdate { .. } => "server-update",
            WireMessage::Conflict { .. } => "conflict",
        }
    }
}

/// Per-item outcome of a pushed change (spec §6): `{success: true}` |
/// `{success: false, conflict: true, conflictType, remoteVersion}` |
/// `{success: false, error}`. `remoteData` rides along beyond the documented
/// shape: §4.E step 4 has the engine invoke the resolver the instant a
/// conflict outcome arrives, which needs the conflicting remote row rather
/// than a second round trip, so this server inlines it (see DESIGN.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub success: bool,
    #[serde(default)]
    pub conflict: bool,
    #[serde(rename = "conflictType", default, skip_serializing_if = "Option::is_none")]
    pub conflict_type: Option<String>,
    #[serde(rename = "remoteVersion", default, skip_serializing_if = "Option::is_none")]
    pub remote_version: Option<u64>,
    #[serde(rename = "remoteData", default, skip_serializing_if = "Option::is_none")]
    pub remote_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            conflict: false,
            conflict_type: None,
            remote_version: None,
            remote_data: None,
            error: None,
        }
    }

    pub fn conflict(conflict_type: impl Into<String>, remote_version: u64) -> Self {
        Self {
            success: false,
            conflict: true,
            conflict_type: Some(conflict_type.into()),
            remote_version: Some(remote_version),
            remote_data: None,
            error: None,
        }
    }

    /// A conflict outcome that also carries the conflicting remote row.
    pub fn conflict_with_data(conflict_type: impl Into<String>, remote_version: u64, remote_data: Value) -> Self {
        Self {
            remote_data: Some(remote_data),
            ..Self::conflict(conflict_type, remote_version)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            conflict: false,
            conflict_type: None,
            remote_version: None,
            remote_data: None,
            error: Some(message.into()),
        }
    }
}
