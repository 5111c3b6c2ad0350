//! Offline-first client data layer: an embedded SQL store, a durable change
//! queue, a pluggable conflict resolver, a long-lived duplex sync channel,
//! a three-tier cache, a storage quota manager, a legacy-store migration
//! engine, and a metrics collector, wired together by [`DataLayer`].

pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod metrics;
pub mod migration;
pub mod queue;
pub mod quota;
pub mod resolver;
pub mod store;
pub mod sync;
pub mod types;

use std::sync::Arc;

use tracing::info;

pub use config::StoreConfig;
pub use error::{Result, StoreError};

use cache::MultiLayerCache;
use channel::DuplexChannel;
use metrics::MetricsCollector;
use migration::{LegacySource, MigrationEngine};
use quota::QuotaManager;
use store::{HostEnvironment, LocalStore};
use sync::SyncEngine;

/// The assembled data layer: every component constructed over one
/// [`LocalStore`] and sharing one [`StoreConfig`]. Construct with
/// [`DataLayer::new`], then call [`DataLayer::start`] to bring up the
/// background tasks (heartbeat, periodic flush, periodic quota probe).
pub struct DataLayer {
    pub store: Arc<LocalStore>,
    pub cache: Arc<MultiLayerCache>,
    pub channel: DuplexChannel,
    pub metrics: MetricsCollector,
    pub quota: Arc<QuotaManager>,
    pub sync: Arc<SyncEngine>,
    config: StoreConfig,
}

impl DataLayer {
    pub fn new(host: Arc<dyn HostEnvironment>, config: StoreConfig) -> Result<Self> {
        let store = Arc::new(LocalStore::open_in_memory(host)?);
        Self::from_store(store, config)
    }

    /// Open the store at a file path on disk rather than in-memory.
    pub fn open(path: impl AsRef<std::path::Path>, host: Arc<dyn HostEnvironment>, config: StoreConfig) -> Result<Self> {
        let store = LocalStore::new(path, host);
        store.initialize()?;
        Self::from_store(Arc::new(store), config)
    }

    pub fn from_store(store: Arc<LocalStore>, config: StoreConfig) -> Result<Self> {
        let cache = Arc::new(MultiLayerCache::new(store.clone()));
        let channel = DuplexChannel::new(config.device_id, config.reconnect, config.heartbeat_interval);
        let metrics = MetricsCollector::new();
        let quota = Arc::new(QuotaManager::new(store.clone(), config.quota));
        let sync = Arc::new(SyncEngine::new(store.clone(), channel.clone(), metrics.clone(), config.clone()));

        Ok(Self {
            store,
            cache,
            channel,
            metrics,
            quota,
            sync,
            config,
        })
    }

    /// Spawn the periodic background tasks (spec §4.E trigger source
    /// "timer", §4.G, §4.I). Connecting the duplex channel's transport is
    /// the caller's responsibility (it needs an endpoint/URL the host
    /// supplies).
    pub fn start(&self) {
        self.metrics.clone().spawn_periodic_flush(self.store.clone(), self.config.device_id);
        self.quota.clone().spawn_periodic_probe();
        self.store.emergency().clone().spawn_periodic_serializer(self.store.host().clone());

        let listener = self.sync.clone();
        tokio::spawn(async move { listener.start_listening().await });

        let sync = self.sync.clone();
        let interval = self.config.sync_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = sync.sync().await {
                    tracing::warn!(%err, "periodic sync cycle failed");
                }
            }
        });

        info!("data layer started");
    }

    /// Run the one-shot legacy migration if it has not already completed
    /// (spec §4.H preconditions).
    pub async fn migrate_legacy(&self, legacy: Arc<dyn LegacySource>) -> Result<()> {
        let engine = MigrationEngine::new(self.store.clone(), legacy, self.config.migration);
        engine.migrate().await
    }

    /// Typed query surface (spec §4.A, "exposes a typed query surface"):
    /// read a single issue back as [`types::Issue`] instead of raw JSON.
    pub fn issue(&self, id: &str) -> Result<Option<types::Issue>> {
        self.store.get_issue(id)
    }

    pub fn issues_by_status(&self, status: types::Status) -> Result<Vec<types::Issue>> {
        self.store.list_issues_by_status(status)
    }

    pub fn user(&self, id: &str) -> Result<Option<types::User>> {
        self.store.get_user(id)
    }

    /// Read a row without the caller needing to know which table it lives in
    /// (spec §9, "Dynamically-typed payloads").
    pub fn record(&self, table: types::TableName, id: &str) -> Result<Option<types::RecordPayload>> {
        self.store.get_record(table, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::InMemoryHost;

    #[test]
    fn data_layer_assembles_over_an_in_memory_host() {
        let layer = DataLayer::new(Arc::new(InMemoryHost::new()), StoreConfig::default()).unwrap();
        assert!(layer.store.health().is_healthy());
    }

    #[test]
    fn issue_forwards_to_the_typed_query_surface() {
        let layer = DataLayer::new(Arc::new(InMemoryHost::new()), StoreConfig::default()).unwrap();
        let id = types::IssueId::new().to_string();
        let device_id = StoreConfig::default().device_id;
        layer
            .store
            .with_handle(|conn| {
                conn.execute(
                    "INSERT INTO issues(id, title, status, priority, created_at, updated_at, version, locally_modified, device_id, metadata)
                     VALUES (?1, 'Hello', 'pending', 'medium', datetime('now'), datetime('now'), 1, 0, ?2, '{}')",
                    rusqlite::params![id, device_id.to_string()],
                )?;
                Ok(())
            })
            .unwrap();

        let issue = layer.issue(&id).unwrap().unwrap();
        assert_eq!(issue.title, "Hello");

        let record = layer.record(types::TableName::Issues, &id).unwrap().unwrap();
        assert!(record.as_issue().is_some());
    }
}
