//! Configuration surface (spec §6). A plain, injectable struct — never a
//! process-wide singleton (spec §9, "Module-level singletons").

use std::time::Duration;

use crate::types::DeviceId;

/// Conflict policy selector threaded from configuration into the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    LastWriteWins,
    RemoteWins,
    LocalWins,
    Merge,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::LastWriteWins
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaConfig {
    pub warn: f64,
    pub critical: f64,
    pub probe_interval: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            warn: 0.80,
            critical: 0.95,
            probe_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub layer1_ttl: Duration,
    pub layer2_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            layer1_ttl: Duration::from_secs(300),
            layer2_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationConfig {
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            inter_batch_delay: Duration::from_millis(100),
        }
    }
}

/// Top-level options object (spec §6). Constructed with [`Default`] and
/// adjusted with the `with_*` builder methods, then handed to each
/// component's constructor.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub ws_endpoint: Option<String>,
    pub batch_size: usize,
    pub sync_interval: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectConfig,
    pub quota: QuotaConfig,
    pub cache: CacheConfig,
    pub migration: MigrationConfig,
    pub conflict_strategy: ConflictStrategy,
    pub device_id: DeviceId,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ws_endpoint: None,
            batch_size: 100,
            sync_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
            quota: QuotaConfig::default(),
            cache: CacheConfig::default(),
            migration: MigrationConfig::default(),
            conflict_strategy: ConflictStrategy::default(),
            device_id: DeviceId::new(),
        }
    }
}

impl StoreConfig {
    pub fn with_ws_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.ws_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_device_id(mut self, device_id: DeviceId) -> Self {
        self.device_id = device_id;
        self
    }
}
