//! Metrics Collector (spec §4.I): an in-memory bounded reservoir per
//! `(family, operation)`, with a periodic flush of percentiles into the
//! local store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::params;
use tracing::debug;

use crate::error::Result;
use crate::store::LocalStore;
use crate::types::DeviceId;

/// Reservoir size (spec §4.I: "last N=1000 samples").
const RESERVOIR_SIZE: usize = 1000;
/// In-memory retention (spec §4.I): older samples are dropped on insert.
const IN_MEMORY_RETENTION: chrono::Duration = chrono::Duration::hours(1);

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: f64,
    at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Default)]
struct Reservoir {
    samples: std::collections::VecDeque<Sample>,
}

impl Reservoir {
    fn push(&mut self, value: f64, at: chrono::DateTime<Utc>) {
        self.samples.push_back(Sample { value, at });
        while self.samples.len() > RESERVOIR_SIZE {
            self.samples.pop_front();
        }
        let cutoff = at - IN_MEMORY_RETENTION;
        while self.samples.front().is_some_and(|s| s.at < cutoff) {
            self.samples.pop_front();
        }
    }

    fn percentiles(&self) -> Percentiles {
        if self.samples.is_empty() {
            return Percentiles::default();
        }
        let mut values: Vec<f64> = self.samples.iter().map(|s| s.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Percentiles {
            p50: percentile_of(&values, 0.50),
            p95: percentile_of(&values, 0.95),
            p99: percentile_of(&values, 0.99),
        }
    }

    fn rate_per_second(&self, window: chrono::Duration, now: chrono::DateTime<Utc>) -> f64 {
        let cutoff = now - window;
        let count = self.samples.iter().filter(|s| s.at >= cutoff).count();
        let window_secs = window.num_milliseconds() as f64 / 1000.0;
        if window_secs <= 0.0 {
            return 0.0;
        }
        count as f64 / window_secs
    }
}

fn percentile_of(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// In-memory reservoir collector (spec §4.I). Construct once and share via
/// `Arc`/`clone` between the Sync Engine, Duplex Channel, and Multi-Layer
/// Cache the way it instruments them.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    reservoirs: Arc<Mutex<HashMap<(String, String), Reservoir>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, family: impl Into<String>, metric: impl Into<String>, value: f64) {
        let key = (family.into(), metric.into());
        self.reservoirs.lock().entry(key).or_default().push(value, Utc::now());
    }

    pub fn percentiles(&self, family: &str, metric: &str) -> Percentiles {
        self.reservoirs
            .lock()
            .get(&(family.to_string(), metric.to_string()))
            .map(Reservoir::percentiles)
            .unwrap_or_default()
    }

    pub fn rate(&self, family: &str, metric: &str, window_ms: i64) -> f64 {
        let now = Utc::now();
        self.reservoirs
            .lock()
            .get(&(family.to_string(), metric.to_string()))
            .map(|r| r.rate_per_second(chrono::Duration::milliseconds(window_ms), now))
            .unwrap_or(0.0)
    }

    /// Flush P50/P95/P99 rows for every tracked `(family, operation)` into
    /// `performance_metrics` (spec §4.I). Called every 60s by
    /// [`MetricsCollector::spawn_periodic_flush`].
    pub fn flush(&self, store: &LocalStore, device_id: DeviceId) -> Result<()> {
        let snapshot: Vec<((String, String), Percentiles)> = self
            .reservoirs
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.percentiles()))
            .collect();

        store.with_handle(|conn| {
            let now = Utc::now().to_rfc3339();
            for ((family, operation), pct) in &snapshot {
                for (tag, value) in [("p50", pct.p50), ("p95", pct.p95), ("p99", pct.p99)] {
                    conn.execute(
                        "INSERT INTO performance_metrics(family, operation, value, percentile, created_at, device_id)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![family, operation, value, tag, now, device_id.to_string()],
                    )?;
                }
            }
            Ok(())
        })?;
        debug!(families = snapshot.len(), "flushed performance metrics");
        Ok(())
    }

    /// Spawn the 60s periodic flush task (spec §4.I).
    pub fn spawn_periodic_flush(self, store: Arc<LocalStore>, device_id: DeviceId) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                if let Err(err) = self.flush(&store, device_id) {
                    tracing::warn!(%err, "performance metric flush failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryHost;

    #[test]
    fn percentiles_over_uniform_samples() {
        let metrics = MetricsCollector::new();
        for v in 1..=100 {
            metrics.record("sync", "push_latency", v as f64);
        }
        let pct = metrics.percentiles("sync", "push_latency");
        assert!((pct.p50 - 50.0).abs() <= 1.0);
        assert!(pct.p95 >= 94.0);
        assert!(pct.p99 >= 98.0);
    }

    #[test]
    fn reservoir_bounded_to_1000_samples() {
        let metrics = MetricsCollector::new();
        for v in 0..2000 {
            metrics.record("sync", "push_latency", v as f64);
        }
        let reservoirs = metrics.reservoirs.lock();
        let reservoir = reservoirs
            .get(&("sync".to_string(), "push_latency".to_string()))
            .unwrap();
        assert!(reservoir.samples.len() <= RESERVOIR_SIZE);
    }

    #[test]
    fn flush_writes_rows_to_store() {
        let store = LocalStore::open_in_memory(Arc::new(InMemoryHost::new())).unwrap();
        let metrics = MetricsCollector::new();
        metrics.record("sync", "push_latency", 10.0);
        metrics.flush(&store, DeviceId::new()).unwrap();

        store
            .with_handle(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM performance_metrics", [], |r| r.get(0))?;
                assert_eq!(count, 3);
                Ok(())
            })
            .unwrap();
    }
}
