//! Typed query surface over the embedded store (spec §4.A, "exposes a
//! typed query surface"): reads full rows back as [`Issue`]/[`User`]
//! instead of the raw JSON the change queue and wire protocol pass
//! around, using the same row-to-struct mapping [`crate::queue`] uses for
//! [`crate::types::ChangeRecord`].

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::manager::LocalStore;
use crate::error::Result;
use crate::types::{DeviceId, Issue, IssueId, RecordPayload, Status, TableName, User, UserId, Version};

const ISSUE_COLUMNS: &str = "id, title, description, status, priority, assignee, session_id, task_id,
     created_at, updated_at, completed_at, version, locally_modified, deleted_at, metadata, device_id";

const USER_COLUMNS: &str = "id, display_name, email, created_at, updated_at, last_sync_at, origin_device";

impl LocalStore {
    pub fn get_issue(&self, id: &str) -> Result<Option<Issue>> {
        self.with_handle(|conn| {
            conn.query_row(
                &format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?1"),
                params![id],
                row_to_issue,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Live (non-deleted) issues in a given status, newest first.
    pub fn list_issues_by_status(&self, status: Status) -> Result<Vec<Issue>> {
        self.with_handle(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ISSUE_COLUMNS} FROM issues WHERE status = ?1 AND deleted_at IS NULL ORDER BY updated_at DESC"
            ))?;
            let rows = stmt
                .query_map(params![status.as_str()], row_to_issue)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.with_handle(|conn| {
            conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                row_to_user,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        self.with_handle(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY display_name ASC"))?;
            let rows = stmt.query_map([], row_to_user)?.collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Fetch a row without the caller needing to know which table it lives
    /// in ahead of time: dispatch on `table`, return the matching variant
    /// (spec §9, "Dynamically-typed payloads").
    pub fn get_record(&self, table: TableName, id: &str) -> Result<Option<RecordPayload>> {
        match table {
            TableName::Issues => Ok(self.get_issue(id)?.map(RecordPayload::Issue)),
            TableName::Users => Ok(self.get_user(id)?.map(RecordPayload::User)),
        }
    }
}

fn row_to_issue(row: &Row<'_>) -> rusqlite::Result<Issue> {
    let id: String = row.get(0)?;
    let status_str: String = row.get(3)?;
    let priority_str: String = row.get(4)?;
    let assignee: Option<String> = row.get(5)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    let completed_at: Option<String> = row.get(10)?;
    let deleted_at: Option<String> = row.get(13)?;
    let metadata_str: String = row.get(14)?;
    let device_str: String = row.get(15)?;

    Ok(Issue {
        id: IssueId(id.parse().map_err(|_| sql_err("id"))?),
        title: row.get(1)?,
        description: row.get(2)?,
        status: status_str.parse().map_err(|_| sql_err("status"))?,
        priority: priority_str.parse().map_err(|_| sql_err("priority"))?,
        assignee: assignee
            .map(|s| s.parse().map(UserId))
            .transpose()
            .map_err(|_| sql_err("assignee"))?,
        session_id: row.get(6)?,
        task_id: row.get(7)?,
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
        completed_at: completed_at.map(|s| parse_dt(&s)).transpose()?,
        version: Version(row.get::<_, i64>(11)? as u64),
        locally_modified: row.get::<_, i64>(12)? != 0,
        deleted_at: deleted_at.map(|s| parse_dt(&s)).transpose()?,
        metadata: serde_json::from_str(&metadata_str).map_err(|_| sql_err("metadata"))?,
        device_id: DeviceId(device_str.parse().map_err(|_| sql_err("device_id"))?),
    })
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    let last_sync_at: Option<String> = row.get(5)?;
    let origin_device: String = row.get(6)?;

    Ok(User {
        id: UserId(id.parse().map_err(|_| sql_err("id"))?),
        display_name: row.get(1)?,
        email: row.get(2)?,
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
        last_sync_at: last_sync_at.map(|s| parse_dt(&s)).transpose()?,
        origin_device: DeviceId(origin_device.parse().map_err(|_| sql_err("origin_device"))?),
    })
}

fn parse_dt(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc)).map_err(|_| sql_err("timestamp"))
}

fn sql_err(column: &'static str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnName(column.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::InMemoryHost;
    use crate::types::Priority;

    fn store() -> LocalStore {
        LocalStore::open_in_memory(Arc::new(InMemoryHost::new())).unwrap()
    }

    fn seed_issue(store: &LocalStore, id: &str, title: &str, status: &str) {
        store
            .with_handle(|conn| {
                conn.execute(
                    "INSERT INTO issues(id, title, status, priority, created_at, updated_at, version, locally_modified, device_id, metadata)
                     VALUES (?1, ?2, ?3, 'medium', datetime('now'), datetime('now'), 1, 0, ?4, '{}')",
                    params![id, title, status, DeviceId::new().to_string()],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn get_issue_round_trips_typed_fields() {
        let store = store();
        let id = IssueId::new().to_string();
        seed_issue(&store, &id, "Write tests", "pending");
        let issue = store.get_issue(&id).unwrap().unwrap();
        assert_eq!(issue.title, "Write tests");
        assert_eq!(issue.status, Status::Pending);
        assert_eq!(issue.priority, Priority::Medium);
    }

    #[test]
    fn list_issues_by_status_excludes_other_statuses() {
        let store = store();
        seed_issue(&store, &IssueId::new().to_string(), "A", "pending");
        seed_issue(&store, &IssueId::new().to_string(), "B", "completed");
        let pending = store.list_issues_by_status(Status::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].title, "A");
    }

    #[test]
    fn get_record_dispatches_by_table() {
        let store = store();
        let id = IssueId::new().to_string();
        seed_issue(&store, &id, "A", "pending");
        let record = store.get_record(TableName::Issues, &id).unwrap().unwrap();
        assert!(record.as_issue().is_some());
        assert!(store.get_record(TableName::Users, "missing").unwrap().is_none());
    }
}
