//! Runtime-mutable flags.
//!
//! Read path: local cache (if fresh) → KV store at `flags:dynamic:<name>`
//! (JSON-decoded) → compiled-in default. Writes go through the KV store and
//! update the local cache, so readers in the same process see the new value
//! immediately while other processes converge within the cache TTL. The
//! cache is advisory: correctness never depends on residency.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use super::FlagValue;
use crate::error::CoreResult;
use crate::kv::KvStore;
use crate::util::{Clock, SystemClock};

/// Default freshness window for locally cached values.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 30;

/// Key prefix for dynamic flag storage.
const KEY_PREFIX: &str = "flags:dynamic";

#[derive(Debug, Clone)]
struct CachedFlag {
    /// `None` records a confirmed KV miss so repeated reads within the TTL
    /// do not hit the backend again.
    value: Option<FlagValue>,
    fetched_at: DateTime<Utc>,
}

/// Runtime-mutable flag layer over the KV store.
pub struct DynamicFlags {
    kv: Arc<dyn KvStore>,
    cache: DashMap<String, CachedFlag>,
    cache_ttl: Duration,
    defaults: HashMap<String, FlagValue>,
    clock: Arc<dyn Clock>,
}

impl DynamicFlags {
    /// Create a layer with the default 30-second cache TTL.
    pub fn new(kv: Arc<dyn KvStore>, defaults: HashMap<String, FlagValue>) -> Self {
        Self::with_cache_ttl(kv, defaults, DEFAULT_CACHE_TTL_SECS)
    }

    /// Create a layer with an explicit cache TTL in seconds.
    pub fn with_cache_ttl(
        kv: Arc<dyn KvStore>,
        defaults: HashMap<String, FlagValue>,
        cache_ttl_secs: u64,
    ) -> Self {
        Self {
            kv,
            cache: DashMap::new(),
            cache_ttl: Duration::seconds(cache_ttl_secs as i64),
            defaults,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn storage_key(name: &str) -> String {
        format!("{}:{}", KEY_PREFIX, name)
    }

    /// Resolve a flag. Backend failures fall through to the compiled-in
    /// default rather than failing the read.
    pub async fn get(&self, name: &str) -> Option<FlagValue> {
        let now = self.clock.now();

        if let Some(cached) = self.cache.get(name) {
            if now - cached.fetched_at < self.cache_ttl {
                return cached
                    .value
                    .clone()
                    .or_else(|| self.defaults.get(name).cloned());
            }
        }

        let from_kv = match self.kv.get(&Self::storage_key(name)).await {
            Ok(Some(raw)) => serde_json::from_str::<FlagValue>(&raw).ok(),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(flag = name, error = %err, "dynamic flag read fell back to default");
                return self.defaults.get(name).cloned();
            }
        };

        self.cache.insert(
            name.to_string(),
            CachedFlag {
                value: from_kv.clone(),
                fetched_at: now,
            },
        );

        from_kv.or_else(|| self.defaults.get(name).cloned())
    }

    /// Boolean convenience over [`DynamicFlags::get`].
    pub async fn get_bool(&self, name: &str, fallback: bool) -> bool {
        self.get(name).await.map(|v| v.as_bool()).unwrap_or(fallback)
    }

    /// Write-through update: KV first, local cache second. The cache entry
    /// is only refreshed once the backend commit succeeded, so readers
    /// never observe a value the store does not hold.
    pub async fn set(&self, name: &str, value: FlagValue) -> CoreResult<()> {
        let raw = serde_json::to_string(&value)
            .map_err(|e| crate::error::CoreError::Internal(e.to_string()))?;
        self.kv.set(&Self::storage_key(name), &raw, None).await?;
        self.cache.insert(
            name.to_string(),
            CachedFlag {
                value: Some(value),
                fetched_at: self.clock.now(),
            },
        );
        Ok(())
    }

    /// Remove the runtime override; readers fall back to the default.
    pub async fn reset(&self, name: &str) -> CoreResult<()> {
        self.kv.delete(&Self::storage_key(name)).await?;
        self.cache.remove(name);
        Ok(())
    }
}
