//! # Key/Value Abstraction
//!
//! The single shared substrate of the core. Every trust record, cache
//! entry, queue, and flag override lives behind the [`KvStore`] trait:
//!
//! - **Strings** with optional absolute expiry
//! - **Lists** with Redis-style index semantics
//! - **Sets** with membership by string identity
//! - **Hashes** with field-level operations
//! - **Atomic counters** over integer-valued strings
//! - **Pattern scan** with `*` globs
//!
//! Two backends ship: [`MemoryKv`] for tests and single-process
//! deployments, and [`RedisKv`] for shared state. A key belongs to exactly
//! one shape at a time; an operation against the wrong shape fails with
//! [`KvError::WrongType`] and is never conflated with an absent key or a
//! backend failure.
//!
//! Single-use semantics elsewhere in the core are built on [`KvStore::take`]
//! (atomic read-and-delete) and [`KvStore::set_nx`] (set-if-absent), both of
//! which are atomic on either backend.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::CoreError;

pub mod memory;
pub mod redis;

pub use self::redis::RedisKv;
pub use memory::MemoryKv;

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by KV operations.
///
/// `Ok(None)` / `Ok(false)` style returns cover the key-absent case; these
/// variants cover everything else.
#[derive(Debug, Error)]
pub enum KvError {
    /// The key exists with a different shape than the operation expects.
    #[error("wrong shape for key '{key}'")]
    WrongType {
        /// The offending key.
        key: String,
    },

    /// An arithmetic operation hit a string that is not an integer.
    #[error("value at key '{key}' is not an integer")]
    NotInteger {
        /// The offending key.
        key: String,
    },

    /// The backend could not be reached or returned a protocol error.
    #[error("kv backend error: {0}")]
    Backend(String),
}

impl From<KvError> for CoreError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::WrongType { key } => {
                CoreError::Conflict(format!("kv shape mismatch at '{}'", key))
            }
            KvError::NotInteger { key } => {
                CoreError::Conflict(format!("kv value at '{}' is not an integer", key))
            }
            KvError::Backend(msg) => CoreError::BackendUnavailable(msg),
        }
    }
}

/// Result alias for KV operations.
pub type KvResult<T> = std::result::Result<T, KvError>;

// ============================================================================
// Store contract
// ============================================================================

/// Typed key/value store with TTLs, lists, sets, hashes, and counters.
///
/// Every method may suspend (the external backend performs I/O). TTLs are
/// seconds from now; `None` or `Some(0)` means no expiry. Reads observe
/// expiry: an expired key behaves exactly like an absent one.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read the string at `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Write a string, replacing any existing shape at `key`.
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> KvResult<()>;

    /// Write a string only if `key` is absent. Returns whether the write
    /// happened. This is the set-if-absent primitive behind idempotency
    /// claims and delivery CAS markers.
    async fn set_nx(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> KvResult<bool>;

    /// Atomically read and delete the string at `key`. Among concurrent
    /// callers exactly one observes the value.
    async fn take(&self, key: &str) -> KvResult<Option<String>>;

    /// Delete `key` of any shape. Returns whether a key existed.
    async fn delete(&self, key: &str) -> KvResult<bool>;

    /// Whether `key` exists (observing expiry).
    async fn exists(&self, key: &str) -> KvResult<bool>;

    /// Apply a TTL to an existing key of any shape. Returns `false` if the
    /// key is absent.
    async fn expire(&self, key: &str, ttl_secs: u64) -> KvResult<bool>;

    /// Remaining TTL in seconds; `-1` if the key has no expiry, `-2` if the
    /// key is absent.
    async fn ttl(&self, key: &str) -> KvResult<i64>;

    /// Atomically increment the integer at `key` by 1, initializing an
    /// absent key to 0 first.
    async fn incr(&self, key: &str) -> KvResult<i64>;

    /// Atomically increment the integer at `key` by `delta`.
    async fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64>;

    /// Prepend values; returns the new list length.
    async fn lpush(&self, key: &str, values: &[String]) -> KvResult<u64>;

    /// Append values; returns the new list length.
    async fn rpush(&self, key: &str, values: &[String]) -> KvResult<u64>;

    /// Pop from the head; `None` on empty or absent.
    async fn lpop(&self, key: &str) -> KvResult<Option<String>>;

    /// Pop from the tail; `None` on empty or absent.
    async fn rpop(&self, key: &str) -> KvResult<Option<String>>;

    /// Slice of the list; negative indices count from the end; empty on
    /// absent.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>>;

    /// List length; 0 on absent.
    async fn llen(&self, key: &str) -> KvResult<u64>;

    /// Trim the list to the inclusive range, Redis-style.
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> KvResult<()>;

    /// Remove occurrences of `value`: `count > 0` from the head, `count < 0`
    /// from the tail, `count == 0` all. Returns how many were removed.
    async fn lrem(&self, key: &str, count: i64, value: &str) -> KvResult<u64>;

    /// Add members; returns how many were new.
    async fn sadd(&self, key: &str, members: &[String]) -> KvResult<u64>;

    /// Remove members; returns how many were present.
    async fn srem(&self, key: &str, members: &[String]) -> KvResult<u64>;

    /// All members, unordered.
    async fn smembers(&self, key: &str) -> KvResult<Vec<String>>;

    /// Membership test by string identity.
    async fn sismember(&self, key: &str, member: &str) -> KvResult<bool>;

    /// Set cardinality; 0 on absent.
    async fn scard(&self, key: &str) -> KvResult<u64>;

    /// Read one hash field.
    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>>;

    /// Write one hash field; returns whether the field was new.
    async fn hset(&self, key: &str, field: &str, value: &str) -> KvResult<bool>;

    /// Delete one hash field; returns whether it existed.
    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool>;

    /// The whole hash; empty on absent.
    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>>;

    /// Keys matching a `*` glob. The returned snapshot is safe to iterate.
    /// The external backend uses cursor scans and never blocks the server
    /// on a full keyspace walk.
    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>>;

    /// Round-trip liveness check.
    async fn ping(&self) -> KvResult<()>;

    /// Drop everything. Administrative; tests and tooling only.
    async fn flushall(&self) -> KvResult<()>;
}

// ============================================================================
// Glob matching
// ============================================================================

/// Match `text` against a glob where `*` matches any run of characters.
///
/// This is the only wildcard the pattern-scan contract supports; `?` and
/// character classes are taken literally.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut remaining = text;

    // Anchor the first segment at the start unless the pattern opens with *.
    let first = segments[0];
    if !first.is_empty() {
        match remaining.strip_prefix(first) {
            Some(rest) => remaining = rest,
            None => return false,
        }
    }

    // Anchor the last segment at the end unless the pattern closes with *.
    let last = segments[segments.len() - 1];
    let mut tail_budget = remaining;
    if !last.is_empty() {
        match remaining.strip_suffix(last) {
            Some(rest) => tail_budget = rest,
            None => return false,
        }
    }

    // Middle segments must appear in order within what is left.
    let mut haystack = tail_budget;
    for segment in &segments[1..segments.len().saturating_sub(1)] {
        if segment.is_empty() {
            continue;
        }
        match haystack.find(segment) {
            Some(pos) => haystack = &haystack[pos + segment.len()..],
            None => return false,
        }
    }

    true
}

/// Normalize a possibly-negative Redis-style index against a length,
/// clamping to the valid range. Returns `None` when the range is empty.
pub(crate) fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len_i = len as i64;
    let mut start = if start < 0 { len_i + start } else { start };
    let mut stop = if stop < 0 { len_i + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len_i {
        stop = len_i - 1;
    }
    if start > stop || start >= len_i {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn glob_exact_without_star() {
        assert!(glob_match("rate:user1:60", "rate:user1:60"));
        assert!(!glob_match("rate:user1:60", "rate:user1:61"));
    }

    #[test]
    fn glob_prefix_and_suffix() {
        assert!(glob_match("session:*", "session:conv-9"));
        assert!(!glob_match("session:*", "block:conv-9"));
        assert!(glob_match("*:global", "audit:global"));
        assert!(glob_match("dns:v1:*", "dns:v1:example.com"));
    }

    #[test]
    fn glob_middle_segments_in_order() {
        assert!(glob_match("webhook:*:events", "webhook:abc:events"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "acb"));
        assert!(glob_match("*", "anything at all"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn range_normalization_matches_redis() {
        assert_eq!(normalize_range(0, -1, 5), Some((0, 4)));
        assert_eq!(normalize_range(-2, -1, 5), Some((3, 4)));
        assert_eq!(normalize_range(1, 2, 5), Some((1, 2)));
        assert_eq!(normalize_range(3, 1, 5), None);
        assert_eq!(normalize_range(9, 12, 5), None);
        assert_eq!(normalize_range(0, 0, 0), None);
    }

    proptest! {
        #[test]
        fn glob_star_matches_any_suffix(s in "[a-z0-9:]{0,24}") {
            prop_assert!(glob_match("k:*", &format!("k:{}", s)), "glob star should match suffix");
        }

        #[test]
        fn glob_literal_matches_itself(s in "[a-z0-9:._-]{1,24}") {
            prop_assert!(glob_match(&s, &s));
        }
    }
}
