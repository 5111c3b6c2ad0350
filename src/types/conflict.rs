use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TableName;

pub type ConflictId = i64;

/// Classifier for a pair of concurrent versions (spec §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    UpdateUpdate,
    UpdateDelete,
    CreateCreate,
    DeleteDelete,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::UpdateUpdate => "UPDATE_UPDATE",
            ConflictKind::UpdateDelete => "UPDATE_DELETE",
            ConflictKind::CreateCreate => "CREATE_CREATE",
            ConflictKind::DeleteDelete => "DELETE_DELETE",
        }
    }
}

/// Which side (or strategy) prevailed, or whether a human must decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    LocalWins,
    RemoteWins,
    Merged,
    UserDecision,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::LocalWins => "LOCAL_WINS",
            Resolution::RemoteWins => "REMOTE_WINS",
            Resolution::Merged => "MERGED",
            Resolution::UserDecision => "USER_DECISION",
        }
    }

    /// Whether this resolution was reached without user intervention.
    pub fn is_auto_resolved(self) -> bool {
        !matches!(self, Resolution::UserDecision)
    }
}

/// A persisted, unresolved (or resolved-and-awaiting-acknowledgement)
/// conflict (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: ConflictId,
    pub table: TableName,
    pub row_id: String,
    pub local_data: serde_json::Value,
    pub remote_data: serde_json::Value,
    pub kind: ConflictKind,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
}

impl Conflict {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}
