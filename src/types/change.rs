use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TableName;

pub type ChangeId = i64;

/// Operation captured by a [`ChangeRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = crate::error::StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Operation::Create),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(crate::error::StoreError::Internal(format!(
                "invalid operation {other}"
            ))),
        }
    }
}

/// A row in the Change Queue (spec §3, §4.B): one local mutation awaiting
/// remote application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_id: ChangeId,
    pub table: TableName,
    pub row_id: String,
    pub operation: Operation,
    pub payload: serde_json::Value,
    pub device_id: super::DeviceId,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    pub fn is_synced(&self) -> bool {
        self.synced_at.is_some()
    }

    pub fn is_dead(&self) -> bool {
        self.retries >= crate::queue::MAX_RETRIES
    }
}
