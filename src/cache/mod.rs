//! Multi-Layer Cache (spec §4.F): read-through over (in-process map, a
//! table in the local store, remote fetch), with stale-on-error semantics.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::LocalStore;
use crate::types::CacheRow;

/// A non-empty ordered sequence of strings, joined into one canonical key
/// used identically by all three tiers (spec §4.F).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(parts: &[&str]) -> Self {
        assert!(!parts.is_empty(), "cache key must not be empty");
        Self(parts.join("\u{1f}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        CacheKey::new(&[value])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    pub layer1_ttl: Duration,
    pub layer2_ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            layer1_ttl: Duration::from_secs(300),
            layer2_ttl: Duration::from_secs(3600),
        }
    }
}

struct L1Entry {
    value: Value,
    written_at: chrono::DateTime<Utc>,
    ttl: Duration,
}

impl L1Entry {
    fn is_expired(&self, now: chrono::DateTime<Utc>) -> bool {
        let age_ms = (now - self.written_at).num_milliseconds().max(0) as u64;
        age_ms > self.ttl.as_millis() as u64
    }
}

/// Three-tier read-through cache (spec §4.F). L1 is touched only by cache
/// operations (spec §5, "Shared resources"); invalidation is announced
/// through `on_invalidate`.
pub struct MultiLayerCache {
    l1: Mutex<HashMap<String, L1Entry>>,
    store: Arc<LocalStore>,
    on_invalidate: Mutex<Vec<Arc<dyn Fn(&str) + Send + Sync>>>,
}

impl MultiLayerCache {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self {
            l1: Mutex::new(HashMap::new()),
            store,
            on_invalidate: Mutex::new(Vec::new()),
        }
    }

    pub fn on_invalidate(&self, listener: Arc<dyn Fn(&str) + Send + Sync>) {
        self.on_invalidate.lock().push(listener);
    }

    /// Read-through `get` (spec §4.F). On L1 hit, returns immediately; on
    /// L2 hit (not expired), promotes to L1; otherwise calls `fetcher` and
    /// writes through both tiers. If `fetcher` fails, returns any stale L1
    /// or L2 payload if present, else propagates the error.
    pub async fn get<F, Fut>(&self, key: &CacheKey, fetcher: F, opts: CacheOptions) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let now = Utc::now();

        if let Some(entry) = self.l1.lock().get(key.as_str()) {
            if !entry.is_expired(now) {
                return Ok(entry.value.clone());
            }
        }

        if let Some(row) = self.read_l2(key)? {
            if !row.is_expired(now) {
                self.write_l1(key, row.payload.clone(), opts.layer1_ttl);
                return Ok(row.payload);
            }
        }

        match fetcher().await {
            Ok(value) => {
                self.write_l1(key, value.clone(), opts.layer1_ttl);
                self.write_l2(key, &value, opts.layer2_ttl)?;
                Ok(value)
            }
            Err(err) => {
                warn!(key = key.as_str(), %err, "fetcher failed, falling back to stale entry");
                if let Some(entry) = self.l1.lock().get(key.as_str()) {
                    return Ok(entry.value.clone());
                }
                if let Some(row) = self.read_l2(key)? {
                    return Ok(row.payload);
                }
                Err(err)
            }
        }
    }

    /// Same as `get` but never returns the payload, and always writes to
    /// L2 (spec §4.F).
    pub async fn prefetch<F, Fut>(&self, key: &CacheKey, fetcher: F, opts: CacheOptions) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let value = fetcher().await?;
        self.write_l1(key, value.clone(), opts.layer1_ttl);
        self.write_l2(key, &value, opts.layer2_ttl)?;
        Ok(())
    }

    /// Partition `keys` into {L1-hit, L2-hit, miss} and fetch the misses in
    /// one call (spec §4.F).
    pub async fn batch_get<F, Fut>(
        &self,
        keys: &[CacheKey],
        batch_fetcher: F,
        opts: CacheOptions,
    ) -> Result<HashMap<String, Value>>
    where
        F: FnOnce(Vec<CacheKey>) -> Fut,
        Fut: Future<Output = Result<HashMap<String, Value>>>,
    {
        let now = Utc::now();
        let mut results = HashMap::new();
        let mut misses = Vec::new();

        for key in keys {
            if let Some(entry) = self.l1.lock().get(key.as_str()) {
                if !entry.is_expired(now) {
                    results.insert(key.as_str().to_string(), entry.value.clone());
                    continue;
                }
            }
            match self.read_l2(key)? {
                Some(row) if !row.is_expired(now) => {
                    self.write_l1(key, row.payload.clone(), opts.layer1_ttl);
                    results.insert(key.as_str().to_string(), row.payload);
                }
                _ => misses.push(key.clone()),
            }
        }

        if !misses.is_empty() {
            let fetched = batch_fetcher(misses).await?;
            for (k, v) in fetched {
                let key = CacheKey(k.clone());
                self.write_l1(&key, v.clone(), opts.layer1_ttl);
                self.write_l2(&key, &v, opts.layer2_ttl)?;
                results.insert(k, v);
            }
        }

        Ok(results)
    }

    /// Purge `key` from L1 and L2 and notify subscribers (spec §4.F).
    pub fn invalidate(&self, key: &CacheKey) -> Result<()> {
        self.l1.lock().remove(key.as_str());
        self.store.with_handle(|conn| {
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key.as_str()])?;
            Ok(())
        })?;
        for listener in self.on_invalidate.lock().iter() {
            listener(key.as_str());
        }
        Ok(())
    }

    pub fn clear_all(&self) -> Result<()> {
        self.l1.lock().clear();
        self.store.with_handle(|conn| {
            conn.execute("DELETE FROM cache_entries", [])?;
            Ok(())
        })
    }

    /// Sweep L2 rows whose `writeInstant + TTL < now` (spec §4.F).
    pub fn clean_expired(&self) -> Result<u64> {
        self.store.with_handle(|conn| {
            let now = Utc::now().to_rfc3339();
            let deleted = conn.execute(
                "DELETE FROM cache_entries
                 WHERE datetime(written_at, '+' || (ttl_ms / 1000) || ' seconds') < ?1",
                params![now],
            )?;
            debug!(deleted, "swept expired L2 cache rows");
            Ok(deleted as u64)
        })
    }

    fn write_l1(&self, key: &CacheKey, value: Value, ttl: Duration) {
        self.l1.lock().insert(
            key.as_str().to_string(),
            L1Entry {
                value,
                written_at: Utc::now(),
                ttl,
            },
        );
    }

    fn write_l2(&self, key: &CacheKey, value: &Value, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        self.store.with_handle(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO cache_entries(key, payload, written_at, ttl_ms) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, written_at = excluded.written_at, ttl_ms = excluded.ttl_ms",
                params![key.as_str(), payload, now, ttl.as_millis() as i64],
            )?;
            Ok(())
        })
    }

    fn read_l2(&self, key: &CacheKey) -> Result<Option<CacheRow>> {
        self.store.with_handle(|conn| {
            let row = conn
                .query_row(
                    "SELECT key, payload, written_at, ttl_ms FROM cache_entries WHERE key = ?1",
                    params![key.as_str()],
                    |row| {
                        let payload_str: String = row.get(1)?;
                        let written_at: String = row.get(2)?;
                        Ok((row.get::<_, String>(0)?, payload_str, written_at, row.get::<_, i64>(3)?))
                    },
                )
                .optional()?;
            Ok(row.map(|(key, payload_str, written_at, ttl_ms)| CacheRow {
                key,
                payload: serde_json::from_str(&payload_str).unwrap_or(Value::Null),
                written_at: chrono::DateTime::parse_from_rfc3339(&written_at)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or(Utc::now()),
                ttl_ms: ttl_ms as u64,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryHost;

    fn cache() -> MultiLayerCache {
        MultiLayerCache::new(Arc::new(LocalStore::open_in_memory(Arc::new(InMemoryHost::new())).unwrap()))
    }

    #[tokio::test]
    async fn miss_calls_fetcher_and_writes_through() {
        let cache = cache();
        let key = CacheKey::from("issue:1");
        let value = cache
            .get(&key, || async { Ok(serde_json::json!({"title": "A"})) }, CacheOptions::default())
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!({"title": "A"}));
        assert!(cache.read_l2(&key).unwrap().is_some());
    }

    #[tokio::test]
    async fn l1_hit_skips_fetcher() {
        let cache = cache();
        let key = CacheKey::from("issue:1");
        cache
            .get(&key, || async { Ok(serde_json::json!(1)) }, CacheOptions::default())
            .await
            .unwrap();

        let value = cache
            .get(&key, || async { panic!("fetcher must not run on L1 hit") }, CacheOptions::default())
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!(1));
    }

    #[tokio::test]
    async fn invalidate_clears_both_tiers() {
        let cache = cache();
        let key = CacheKey::from("issue:1");
        cache
            .get(&key, || async { Ok(serde_json::json!(1)) }, CacheOptions::default())
            .await
            .unwrap();
        cache.invalidate(&key).unwrap();
        assert!(cache.l1.lock().get(key.as_str()).is_none());
        assert!(cache.read_l2(&key).unwrap().is_none());
    }

    #[tokio::test]
    async fn fetcher_error_falls_back_to_stale_value() {
        let cache = cache();
        let key = CacheKey::from("issue:1");
        cache
            .get(&key, || async { Ok(serde_json::json!("stale")) }, CacheOptions::default())
            .await
            .unwrap();
        // force L1 expiry so the next get consults L2/fetcher
        cache.l1.lock().clear();

        let value = cache
            .get(
                &key,
                || async { Err(crate::error::StoreError::Internal("boom".into())) },
                CacheOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!("stale"));
    }
}
