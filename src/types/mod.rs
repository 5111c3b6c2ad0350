//! Shared data model (spec §3): entities that flow between the store, the
//! change queue, the resolver, and the sync engine.

mod change;
mod conflict;
mod issue;
mod metrics;
mod user;

pub use change::{ChangeId, ChangeRecord, Operation};
pub use conflict::{Conflict, ConflictId, ConflictKind, Resolution};
pub use issue::{Issue, IssueId, Priority, Status, Version};
pub use metrics::{BackupBlob, CacheRow, PerformanceMetric, SyncKind, SyncMetric};
pub use user::{DeviceId, User, UserId};

use std::collections::BTreeMap;

/// Free-form metadata carried on an [`Issue`].
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// The name of a table in the local SQL store, used to tag payloads so that
/// routing and merging stay type-directed (spec §9, "Dynamically-typed
/// payloads").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableName {
    Users,
    Issues,
}

impl TableName {
    pub fn as_str(self) -> &'static str {
        match self {
            TableName::Users => "users",
            TableName::Issues => "issues",
        }
    }
}

impl std::str::FromStr for TableName {
    type Err = crate::error::StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "users" => Ok(TableName::Users),
            "issues" => Ok(TableName::Issues),
            other => Err(crate::error::StoreError::Internal(format!(
                "unknown table name {other}"
            ))),
        }
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload tagged by the table it belongs to, used wherever the source
/// carried an opaque "any" JSON blob (change snapshots, conflict payloads,
/// cache rows). Routing and merging dispatch on the variant instead of
/// reflecting over JSON.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "table", content = "data")]
pub enum RecordPayload {
    #[serde(rename = "users")]
    User(User),
    #[serde(rename = "issues")]
    Issue(Issue),
}

impl RecordPayload {
    pub fn table(&self) -> TableName {
        match self {
            RecordPayload::User(_) => TableName::Users,
            RecordPayload::Issue(_) => TableName::Issues,
        }
    }

    pub fn as_issue(&self) -> Option<&Issue> {
        match self {
            RecordPayload::Issue(issue) => Some(issue),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&User> {
        match self {
            RecordPayload::User(user) => Some(user),
            _ => None,
        }
    }
}
