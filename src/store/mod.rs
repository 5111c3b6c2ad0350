//! Local Store Manager (spec §4.A): lifecycle of the embedded SQL engine,
//! emergency fallback, schema migration, and health probing.

mod emergency;
mod health;
mod host;
mod manager;
mod query;
mod schema;

pub use emergency::EmergencyMode;
pub use health::{Health, HealthState};
pub use host::{HostEnvironment, InMemoryHost, QuotaEstimate};
pub use manager::LocalStore;
pub use schema::SCHEMA_VERSION;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn initialize_then_health_is_healthy() {
        let store = LocalStore::open_in_memory(Arc::new(InMemoryHost::new())).unwrap();
        assert!(store.health().is_healthy());
        assert!(!store.is_emergency());
    }

    #[test]
    fn insufficient_quota_triggers_emergency_mode() {
        let host = Arc::new(InMemoryHost::new().with_quota(990, 1000));
        let store = LocalStore::open_in_memory(host).unwrap();
        assert!(store.is_emergency());
        assert_eq!(store.health().state, HealthState::Emergency);
    }

    #[test]
    fn missing_durable_store_triggers_emergency_mode() {
        let host = Arc::new(InMemoryHost::absent());
        let store = LocalStore::open_in_memory(host).unwrap();
        assert!(store.is_emergency());
    }

    #[test]
    fn with_handle_writes_through_during_emergency_mode() {
        let host = Arc::new(InMemoryHost::new().with_quota(990, 1000));
        let store = LocalStore::open_in_memory(host).unwrap();
        assert!(store.is_emergency());
        store
            .with_handle(|conn| {
                conn.execute(
                    "INSERT INTO users(id, display_name, created_at, updated_at, origin_device) VALUES ('u1', 'A', datetime('now'), datetime('now'), 'd1')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        let count: i64 = store
            .with_handle(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn reset_clears_ready_state() {
        let store = LocalStore::open_in_memory(Arc::new(InMemoryHost::new())).unwrap();
        store.reset();
        assert!(store.with_handle(|_| Ok(())).is_err());
    }

    #[test]
    fn migrations_are_idempotent() {
        let store = LocalStore::open_in_memory(Arc::new(InMemoryHost::new())).unwrap();
        store
            .with_handle(|conn| Ok(schema::apply(conn).unwrap()))
            .unwrap();
        assert!(store.health().is_healthy());
    }
}
