use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Metadata, UserId};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IssueId(pub Uuid);

impl IssueId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IssueId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for IssueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an [`Issue`]. Only these four values are valid; any
/// other string read back from storage or the wire is a `QueryError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for Status {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "in_progress" => Ok(Status::InProgress),
            "completed" => Ok(Status::Completed),
            "cancelled" => Ok(Status::Cancelled),
            other => Err(StoreError::Internal(format!("invalid status {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(StoreError::Internal(format!("invalid priority {other}"))),
        }
    }
}

/// Monotonic per-row version. A merge never lowers it (spec §3 invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    pub const INITIAL: Version = Version(1);

    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }

    pub fn max(self, other: Version) -> Version {
        Version(self.0.max(other.0))
    }
}

/// A work item (spec §3). `title` must be non-empty; enforced both at
/// construction and as a storage-layer invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub title: String,
    pub description: Option<String>,
    pub status: Status,
    pub priority: Priority,
    pub assignee: Option<UserId>,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: Version,
    pub locally_modified: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub device_id: super::DeviceId,
}

impl Issue {
    /// Construct a new, locally-originated issue. Fails if `title` is empty.
    pub fn new(
        title: impl Into<String>,
        priority: Priority,
        device_id: super::DeviceId,
    ) -> Result<Self, StoreError> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(StoreError::Internal("issue title must not be empty".into()));
        }
        let now = Utc::now();
        Ok(Self {
            id: IssueId::new(),
            title,
            description: None,
            status: Status::Pending,
            priority,
            assignee: None,
            session_id: None,
            task_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: Version::INITIAL,
            locally_modified: true,
            deleted_at: None,
            metadata: Metadata::new(),
            device_id,
        })
    }

    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Soft-delete: never physically removes the row (spec §3 invariants).
    pub fn soft_delete(&mut self, device_id: super::DeviceId) {
        self.deleted_at = Some(Utc::now());
        self.updated_at = Utc::now();
        self.version = self.version.next();
        self.locally_modified = true;
        self.device_id = device_id;
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.title.trim().is_empty() {
            return Err(StoreError::Internal("issue title must not be empty".into()));
        }
        Ok(())
    }
}
