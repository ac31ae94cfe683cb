//! DNS resolution with a short-TTL cache.
//!
//! Resolution sits behind the [`Resolver`] trait so the guard can be tested
//! against scripted answers. The production path is [`SystemResolver`]
//! (A and AAAA via the runtime's lookup) wrapped in [`CachingResolver`],
//! which persists answers at `dns:v1:<hostname>`. Cache lifetime is the
//! minimum of the record's TTL and the configured ceiling; the system
//! resolver does not expose upstream TTLs, so the ceiling is what applies.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::kv::KvStore;
use crate::util::{Clock, SystemClock};

/// Key prefix for cached resolutions. The version bumps on any record
/// schema change.
const CACHE_PREFIX: &str = "dns:v1";

/// Hostname-to-addresses resolution.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve every address (A and AAAA) for a hostname. An empty answer
    /// is an error, never an empty list.
    async fn resolve(&self, hostname: &str) -> CoreResult<Vec<IpAddr>>;
}

// ============================================================================
// System resolver
// ============================================================================

/// Resolver backed by the operating system, with a deadline.
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    /// Create a resolver with the given lookup deadline.
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, hostname: &str) -> CoreResult<Vec<IpAddr>> {
        let lookup = tokio::net::lookup_host((hostname, 0u16));
        let addrs = tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| CoreError::Timeout { stage: "dns" })?
            .map_err(|e| CoreError::BackendUnavailable(format!("dns: {}", e)))?;

        let mut ips: Vec<IpAddr> = addrs.map(|sa| sa.ip()).collect();
        ips.sort();
        ips.dedup();
        if ips.is_empty() {
            return Err(CoreError::BackendUnavailable(format!(
                "dns: no addresses for {}",
                hostname
            )));
        }
        Ok(ips)
    }
}

// ============================================================================
// Caching resolver
// ============================================================================

/// Cached resolution record, stored as sorted-key JSON.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DnsCacheRecord {
    addresses: Vec<IpAddr>,
    resolved_at: DateTime<Utc>,
    /// Original record TTL in seconds; the ceiling when upstream TTLs are
    /// not observable.
    ttl_secs: u64,
}

/// Resolver that caches answers in the KV store.
///
/// The cache is advisory: a backend failure on read or write degrades to a
/// live lookup, never to an error.
pub struct CachingResolver {
    inner: Arc<dyn Resolver>,
    kv: Arc<dyn KvStore>,
    ttl_ceiling_secs: u64,
    clock: Arc<dyn Clock>,
}

impl CachingResolver {
    /// Wrap a resolver with the KV cache.
    pub fn new(inner: Arc<dyn Resolver>, kv: Arc<dyn KvStore>, ttl_ceiling_secs: u64) -> Self {
        Self {
            inner,
            kv,
            ttl_ceiling_secs,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn cache_key(hostname: &str) -> String {
        format!("{}:{}", CACHE_PREFIX, hostname.to_lowercase())
    }
}

#[async_trait]
impl Resolver for CachingResolver {
    async fn resolve(&self, hostname: &str) -> CoreResult<Vec<IpAddr>> {
        let key = Self::cache_key(hostname);

        if let Ok(Some(raw)) = self.kv.get(&key).await {
            if let Ok(record) = serde_json::from_str::<DnsCacheRecord>(&raw) {
                if !record.addresses.is_empty() {
                    return Ok(record.addresses);
                }
            }
        }

        let addresses = self.inner.resolve(hostname).await?;

        let record = DnsCacheRecord {
            addresses: addresses.clone(),
            resolved_at: self.clock.now(),
            ttl_secs: self.ttl_ceiling_secs,
        };
        let ttl = record.ttl_secs.min(self.ttl_ceiling_secs);
        if let Ok(raw) = serde_json::to_string(&record) {
            if let Err(err) = self.kv.set(&key, &raw, Some(ttl)).await {
                tracing::debug!(hostname, error = %err, "dns cache write skipped");
            }
        }

        Ok(addresses)
    }
}

// ============================================================================
// Scripted resolver
// ============================================================================

/// Deterministic resolver for tests and air-gapped runs.
///
/// Each hostname carries a queue of scripted answers; the final answer
/// repeats once the queue drains, so a rebinding script like
/// `[public, loopback]` yields the public answer exactly once.
#[derive(Default)]
pub struct StaticResolver {
    answers: Mutex<std::collections::HashMap<String, VecDeque<Vec<IpAddr>>>>,
    lookups: Mutex<Vec<String>>,
}

impl StaticResolver {
    /// Empty resolver; every lookup fails until hosts are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fixed answer for a hostname.
    pub fn insert(&self, hostname: &str, addresses: Vec<IpAddr>) {
        self.script(hostname, vec![addresses]);
    }

    /// Register a sequence of answers; the last repeats forever.
    pub fn script(&self, hostname: &str, sequence: Vec<Vec<IpAddr>>) {
        self.answers
            .lock()
            .insert(hostname.to_lowercase(), sequence.into());
    }

    /// Every hostname that has been looked up, in order.
    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().clone()
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, hostname: &str) -> CoreResult<Vec<IpAddr>> {
        self.lookups.lock().push(hostname.to_string());
        let mut answers = self.answers.lock();
        let queue = answers
            .get_mut(&hostname.to_lowercase())
            .ok_or_else(|| CoreError::BackendUnavailable(format!("dns: unknown host {}", hostname)))?;
        let answer = if queue.len() > 1 {
            queue.pop_front().expect("non-empty queue")
        } else {
            queue.front().cloned().ok_or_else(|| {
                CoreError::BackendUnavailable(format!("dns: no addresses for {}", hostname))
            })?
        };
        Ok(answer)
    }
}
