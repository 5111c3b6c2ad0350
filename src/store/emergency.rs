//! Emergency mode (spec §4.A step 6, GLOSSARY "Emergency mode"): a volatile
//! in-memory SQL engine that stands in for the durable one when it cannot be
//! opened, periodically serialized to the host's `emergency_backup` slot and
//! recovered into the durable engine the next time it opens successfully.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, Row};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::host::HostEnvironment;
use crate::error::{Result, StoreError};

pub const EMERGENCY_BACKUP_KEY: &str = "emergency_backup";
const SERIALIZE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// The process-wide emergency flag and in-memory engine, mutated only by the
/// store's initializer/serializer and read by every other component through
/// [`super::manager::LocalStore::with_handle`] (spec §5, "Shared resources").
/// Writers observe happens-before the publication of `active` because it is
/// only flipped to `true` after the connection exists.
#[derive(Clone)]
pub struct EmergencyMode {
    active: Arc<AtomicBool>,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl EmergencyMode {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Activate emergency mode: open an in-memory engine, apply the schema,
    /// and ingest a previously serialized blob if the host has one (spec:
    /// "on next successful initialization, attempt to ingest that blob" —
    /// here "successful" means the in-memory engine itself, since the
    /// durable one is what just failed).
    pub fn activate(&self, host: &dyn HostEnvironment) {
        warn!("activating emergency mode");
        let conn = match Connection::open_in_memory() {
            Ok(conn) => conn,
            Err(err) => {
                warn!(%err, "failed to open in-memory emergency engine");
                return;
            }
        };
        if let Err(err) = super::schema::apply(&conn) {
            warn!(%err, "failed to apply schema to emergency engine");
        }
        if let Ok(Some(blob)) = host.kv_get(EMERGENCY_BACKUP_KEY) {
            match serde_json::from_str::<Value>(&blob) {
                Ok(dump) => match restore_tables(&conn, &dump) {
                    Ok(()) => info!("ingested emergency backup into in-memory engine"),
                    Err(err) => warn!(%err, "failed to restore emergency backup"),
                },
                Err(err) => warn!(%err, "emergency backup blob was not valid JSON"),
            }
        }
        *self.conn.lock() = Some(conn);
        self.active.store(true, Ordering::Release);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        *self.conn.lock() = None;
    }

    /// Run `f` against the in-memory engine backing emergency mode. Every
    /// component that reaches the store through
    /// [`super::manager::LocalStore::with_handle`] lands here while
    /// emergency mode is active, so reads and writes actually happen against
    /// something instead of failing outright.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let guard = self.conn.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| StoreError::NotReady("emergency engine not active".into()))?;
        f(conn)
    }

    /// Copy every row accumulated in the emergency engine into `conn`, the
    /// now-durable connection (spec §4.A step 6 recovery). No-op if
    /// emergency mode was never activated.
    pub fn recover_into(&self, conn: &Connection) -> Result<()> {
        let guard = self.conn.lock();
        let Some(emergency_conn) = guard.as_ref() else {
            return Ok(());
        };
        let dump = dump_tables(emergency_conn)?;
        restore_tables(conn, &dump)
    }

    /// Serialize the current engine's tables to the host's
    /// `emergency_backup` slot. Called by the background serializer and
    /// eagerly once on activation's caller.
    pub fn serialize_to_host(&self, host: &dyn HostEnvironment) -> Result<()> {
        let guard = self.conn.lock();
        let Some(conn) = guard.as_ref() else {
            return Ok(());
        };
        let dump = dump_tables(conn)?;
        let blob = serde_json::to_string(&dump)?;
        host.kv_set(EMERGENCY_BACKUP_KEY, &blob)?;
        Ok(())
    }

    /// Spawn the 30s periodic serializer task. Runs until `active` is
    /// cleared by [`EmergencyMode::deactivate`].
    pub fn spawn_periodic_serializer(self, host: Arc<dyn HostEnvironment>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SERIALIZE_INTERVAL);
            loop {
                ticker.tick().await;
                if !self.is_active() {
                    break;
                }
                if let Err(err) = self.serialize_to_host(host.as_ref()) {
                    warn!(%err, "failed to serialize emergency backup");
                }
            }
        });
    }
}

impl Default for EmergencyMode {
    fn default() -> Self {
        Self::new()
    }
}

/// Dump every user table in `conn` to a `{table: [rows...]}` JSON value.
/// BLOB columns are wrapped as `{"__blob__": "<base64>"}` so
/// [`restore_tables`] can tell them apart from TEXT on the way back in.
fn dump_tables(conn: &Connection) -> Result<Value> {
    let mut tables: Vec<String> = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")?
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<_, _>>()?;
    tables.sort();

    let mut dump = serde_json::Map::new();
    for table in tables {
        let mut stmt = conn.prepare(&format!("SELECT * FROM {table}"))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let rows = stmt
            .query_map([], |row| row_to_json(row, &columns))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        dump.insert(table, Value::Array(rows));
    }
    Ok(Value::Object(dump))
}

fn row_to_json(row: &Row<'_>, columns: &[String]) -> rusqlite::Result<Value> {
    let mut obj = serde_json::Map::new();
    for (i, column) in columns.iter().enumerate() {
        let value = match row.get_ref(i)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(n) => Value::from(n),
            ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
            ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => json!({"__blob__": BASE64.encode(b)}),
        };
        obj.insert(column.clone(), value);
    }
    Ok(Value::Object(obj))
}

/// Restore a dump produced by [`dump_tables`] into `conn` via
/// `INSERT OR REPLACE`. Table and column names come from our own dump, never
/// from untrusted input, so interpolating them into the statement is safe.
fn restore_tables(conn: &Connection, dump: &Value) -> Result<()> {
    let Some(tables) = dump.as_object() else {
        return Ok(());
    };
    for (table, rows) in tables {
        let Some(rows) = rows.as_array() else { continue };
        for row in rows {
            let Some(fields) = row.as_object() else { continue };
            if fields.is_empty() {
                continue;
            }
            let columns: Vec<&String> = fields.keys().collect();
            let column_list = columns.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", ");
            let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
            let sql = format!("INSERT OR REPLACE INTO {table} ({column_list}) VALUES ({})", placeholders.join(", "));
            let values: Vec<SqlValue> = columns.iter().map(|c| json_to_sql(&fields[*c])).collect();
            let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
            conn.execute(&sql, params.as_slice())?;
        }
    }
    Ok(())
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => n.as_i64().map(SqlValue::Integer).unwrap_or_else(|| SqlValue::Real(n.as_f64().unwrap_or_default())),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Object(obj) => match obj.get("__blob__").and_then(Value::as_str) {
            Some(b64) => SqlValue::Blob(BASE64.decode(b64).unwrap_or_default()),
            None => SqlValue::Text(value.to_string()),
        },
        Value::Array(_) => SqlValue::Text(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::host::InMemoryHost;

    #[test]
    fn activate_then_with_conn_allows_writes() {
        let mode = EmergencyMode::new();
        let host = InMemoryHost::new();
        mode.activate(&host);
        assert!(mode.is_active());
        mode.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users(id, display_name, created_at, updated_at, origin_device) VALUES ('u1', 'A', datetime('now'), datetime('now'), 'd1')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        let count: i64 = mode.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn serialize_then_reactivate_round_trips_rows() {
        let mode = EmergencyMode::new();
        let host = InMemoryHost::new();
        mode.activate(&host);
        mode.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users(id, display_name, created_at, updated_at, origin_device) VALUES ('u1', 'A', datetime('now'), datetime('now'), 'd1')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        mode.serialize_to_host(&host).unwrap();
        mode.deactivate();
        assert!(!mode.is_active());

        let recovered = EmergencyMode::new();
        recovered.activate(&host);
        let count: i64 = recovered
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn with_conn_errors_when_inactive() {
        let mode = EmergencyMode::new();
        assert!(mode.with_conn(|_| Ok(())).is_err());
    }
}
