//! Conflict Resolver (spec §4.C): a pure function over `(local, remote)`
//! record pairs. Policies are a variant set behind a small trait so new
//! policies plug in without touching the classifier (spec §9,
//! "Polymorphism").

mod policy;

pub use policy::{LastWriteWins, LocalWins, Merge, RemoteWins, ResolverPolicy};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::ConflictStrategy;
use crate::types::{Conflict, ConflictId, ConflictKind, Resolution, TableName};

/// One side of a conflict pair, with just enough structure for
/// classification and merge without the resolver knowing the full
/// [`crate::types::Issue`] shape.
#[derive(Debug, Clone)]
pub struct VersionedRecord {
    pub data: Option<Value>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub modified_at: DateTime<Utc>,
    pub version: u64,
}

impl VersionedRecord {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// The outcome of resolving one conflict pair.
#[derive(Debug, Clone)]
pub struct ResolvedConflict {
    pub payload: Value,
    pub resolution: Resolution,
    pub kind: ConflictKind,
    pub version: u64,
}

/// Fields considered "user-editable critical" for merge purposes (spec
/// §4.C): local is preferred on these when both sides set them.
pub const CRITICAL_FIELDS: &[&str] = &["title", "status", "priority"];

/// Classify a pair of record versions (spec §4.C).
pub fn classify(local: &VersionedRecord, remote: &VersionedRecord) -> ConflictKind {
    match (local.is_live(), remote.is_live()) {
        (true, true) => ConflictKind::UpdateUpdate,
        (true, false) | (false, true) => ConflictKind::UpdateDelete,
        (false, false) => {
            if local.data.is_some() && remote.data.is_some() && local.version <= 1 && remote.version <= 1 {
                ConflictKind::CreateCreate
            } else {
                ConflictKind::DeleteDelete
            }
        }
    }
}

/// Default routing by kind (spec §4.C): `DELETE_DELETE -> RemoteWins`,
/// `UPDATE_DELETE -> LocalWins`, `CREATE_CREATE -> Merge`,
/// `UPDATE_UPDATE -> configured policy`.
pub fn default_policy_for(kind: ConflictKind, configured: ConflictStrategy) -> ConflictStrategy {
    match kind {
        ConflictKind::DeleteDelete => ConflictStrategy::RemoteWins,
        ConflictKind::UpdateDelete => ConflictStrategy::LocalWins,
        ConflictKind::CreateCreate => ConflictStrategy::Merge,
        ConflictKind::UpdateUpdate => configured,
    }
}

/// Resolve one conflict pair using `configured` as the `UPDATE_UPDATE`
/// policy. Pure: same inputs always produce the same output (spec §8,
/// "Resolver determinism").
pub fn resolve(
    local: &VersionedRecord,
    remote: &VersionedRecord,
    configured: ConflictStrategy,
) -> ResolvedConflict {
    let kind = classify(local, remote);
    let strategy = default_policy_for(kind, configured);

    let (payload, resolution, version) = match strategy {
        ConflictStrategy::LastWriteWins => LastWriteWins.resolve(local, remote),
        ConflictStrategy::RemoteWins => RemoteWins.resolve(local, remote),
        ConflictStrategy::LocalWins => LocalWins.resolve(local, remote),
        ConflictStrategy::Merge => Merge.resolve(local, remote),
    };

    ResolvedConflict {
        payload,
        resolution,
        kind,
        version,
    }
}

/// Build a persisted [`Conflict`] row for a pair that did not auto-resolve.
pub fn to_conflict_record(
    conflict_id: ConflictId,
    table: TableName,
    row_id: impl Into<String>,
    local: &Value,
    remote: &Value,
    kind: ConflictKind,
) -> Conflict {
    Conflict {
        conflict_id,
        table,
        row_id: row_id.into(),
        local_data: local.clone(),
        remote_data: remote.clone(),
        kind,
        created_at: Utc::now(),
        resolved_at: None,
        resolution: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(data: Option<Value>, deleted: bool, modified_secs_ago: i64, version: u64) -> VersionedRecord {
        VersionedRecord {
            data,
            deleted_at: if deleted { Some(Utc::now()) } else { None },
            modified_at: Utc::now() - chrono::Duration::seconds(modified_secs_ago),
            version,
        }
    }

    #[test]
    fn classifies_update_delete() {
        let local = record(Some(serde_json::json!({"title": "A"})), false, 10, 2);
        let remote = record(None, true, 5, 2);
        assert_eq!(classify(&local, &remote), ConflictKind::UpdateDelete);
    }

    #[test]
    fn update_delete_keeps_the_live_row_by_default() {
        let local = record(Some(serde_json::json!({"title": "A"})), false, 10, 2);
        let remote = record(None, true, 5, 2);
        let resolved = resolve(&local, &remote, ConflictStrategy::LastWriteWins);
        assert_eq!(resolved.resolution, Resolution::LocalWins);
    }

    #[test]
    fn last_write_wins_ties_break_to_remote() {
        let now = Utc::now();
        let local = VersionedRecord {
            data: Some(serde_json::json!({"title": "A"})),
            deleted_at: None,
            modified_at: now,
            version: 2,
        };
        let remote = VersionedRecord {
            data: Some(serde_json::json!({"title": "B"})),
            deleted_at: None,
            modified_at: now,
            version: 2,
        };
        let resolved = resolve(&local, &remote, ConflictStrategy::LastWriteWins);
        assert_eq!(resolved.resolution, Resolution::RemoteWins);
    }

    #[test]
    fn merge_on_disjoint_fields_auto_resolves() {
        let local = record(Some(serde_json::json!({"title": "A"})), false, 10, 1);
        let remote = record(Some(serde_json::json!({"description": "B"})), false, 5, 1);
        let resolved = resolve(&local, &remote, ConflictStrategy::Merge);
        assert_eq!(resolved.resolution, Resolution::Merged);
        assert_eq!(resolved.payload["title"], serde_json::json!("A"));
        assert_eq!(resolved.payload["description"], serde_json::json!("B"));
    }

    #[test]
    fn merge_escalates_on_conflicting_critical_fields() {
        let local = record(Some(serde_json::json!({"title": "X"})), false, 10, 1);
        let remote = record(Some(serde_json::json!({"title": "Y"})), false, 5, 1);
        let resolved = resolve(&local, &remote, ConflictStrategy::Merge);
        assert_eq!(resolved.resolution, Resolution::UserDecision);
    }
}
