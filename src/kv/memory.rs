//! In-memory KV backend.
//!
//! A single `parking_lot::Mutex` guards the whole map, which keeps every
//! operation, including the get-then-delete pair behind [`KvStore::take`]
//! and the set-if-absent behind [`KvStore::set_nx`], atomic with respect
//! to concurrent callers. Expiry is lazy: any read that observes a due
//! entry removes it first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use super::{glob_match, normalize_range, KvError, KvResult, KvStore};
use crate::util::{Clock, SystemClock};

/// One of the four value shapes a key may hold.
#[derive(Debug, Clone)]
enum KvValue {
    Str(String),
    List(VecDeque<String>),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: KvValue,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// In-memory [`KvStore`] implementation.
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryKv {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store on an injected clock (tests drive expiry manually).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn ttl_to_deadline(&self, ttl_secs: Option<u64>) -> Option<DateTime<Utc>> {
        match ttl_secs {
            None | Some(0) => None,
            Some(secs) => Some(self.clock.now() + Duration::seconds(secs as i64)),
        }
    }

    /// Remove the entry if it is past its expiry, then hand back a live
    /// mutable reference. Callers hold the map lock.
    fn live<'a>(
        map: &'a mut HashMap<String, Entry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a mut Entry> {
        if map.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
            map.remove(key);
        }
        map.get_mut(key)
    }

    /// Fetch the list at `key`, creating it when absent.
    fn list_entry<'a>(
        map: &'a mut HashMap<String, Entry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> KvResult<&'a mut VecDeque<String>> {
        if Self::live(map, key, now).is_none() {
            map.insert(
                key.to_string(),
                Entry {
                    value: KvValue::List(VecDeque::new()),
                    expires_at: None,
                },
            );
        }
        match &mut map.get_mut(key).expect("entry just ensured").value {
            KvValue::List(list) => Ok(list),
            _ => Err(KvError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    fn set_entry<'a>(
        map: &'a mut HashMap<String, Entry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> KvResult<&'a mut HashSet<String>> {
        if Self::live(map, key, now).is_none() {
            map.insert(
                key.to_string(),
                Entry {
                    value: KvValue::Set(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        match &mut map.get_mut(key).expect("entry just ensured").value {
            KvValue::Set(set) => Ok(set),
            _ => Err(KvError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    fn hash_entry<'a>(
        map: &'a mut HashMap<String, Entry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> KvResult<&'a mut HashMap<String, String>> {
        if Self::live(map, key, now).is_none() {
            map.insert(
                key.to_string(),
                Entry {
                    value: KvValue::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match &mut map.get_mut(key).expect("entry just ensured").value {
            KvValue::Hash(hash) => Ok(hash),
            _ => Err(KvError::WrongType {
                key: key.to_string(),
            }),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                KvValue::Str(s) => Ok(Some(s.clone())),
                _ => Err(KvError::WrongType {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> KvResult<()> {
        let expires_at = self.ttl_to_deadline(ttl_secs);
        let mut map = self.entries.lock();
        map.insert(
            key.to_string(),
            Entry {
                value: KvValue::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> KvResult<bool> {
        let now = self.clock.now();
        let expires_at = self.ttl_to_deadline(ttl_secs);
        let mut map = self.entries.lock();
        if Self::live(&mut map, key, now).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: KvValue::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn take(&self, key: &str) -> KvResult<Option<String>> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        let is_str = match Self::live(&mut map, key, now) {
            None => return Ok(None),
            Some(entry) => matches!(entry.value, KvValue::Str(_)),
        };
        if !is_str {
            return Err(KvError::WrongType {
                key: key.to_string(),
            });
        }
        match map.remove(key) {
            Some(Entry {
                value: KvValue::Str(s),
                ..
            }) => Ok(Some(s)),
            _ => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        let existed = Self::live(&mut map, key, now).is_some();
        map.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        Ok(Self::live(&mut map, key, now).is_some())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> KvResult<bool> {
        let now = self.clock.now();
        let deadline = now + Duration::seconds(ttl_secs as i64);
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(false),
            Some(entry) => {
                entry.expires_at = Some(deadline);
                Ok(true)
            }
        }
    }

    async fn ttl(&self, key: &str) -> KvResult<i64> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(-2),
            Some(entry) => match entry.expires_at {
                None => Ok(-1),
                Some(at) => Ok((at - now).num_seconds().max(0)),
            },
        }
    }

    async fn incr(&self, key: &str) -> KvResult<i64> {
        self.incr_by(key, 1).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        if Self::live(&mut map, key, now).is_none() {
            map.insert(
                key.to_string(),
                Entry {
                    value: KvValue::Str(delta.to_string()),
                    expires_at: None,
                },
            );
            return Ok(delta);
        }
        match &mut map.get_mut(key).expect("live entry present").value {
            KvValue::Str(s) => {
                let current: i64 = s.parse().map_err(|_| KvError::NotInteger {
                    key: key.to_string(),
                })?;
                let next = current + delta;
                *s = next.to_string();
                Ok(next)
            }
            _ => Err(KvError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn lpush(&self, key: &str, values: &[String]) -> KvResult<u64> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        let list = Self::list_entry(&mut map, key, now)?;
        for value in values {
            list.push_front(value.clone());
        }
        Ok(list.len() as u64)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> KvResult<u64> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        let list = Self::list_entry(&mut map, key, now)?;
        for value in values {
            list.push_back(value.clone());
        }
        Ok(list.len() as u64)
    }

    async fn lpop(&self, key: &str) -> KvResult<Option<String>> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(None),
            Some(entry) => match &mut entry.value {
                KvValue::List(list) => Ok(list.pop_front()),
                _ => Err(KvError::WrongType {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn rpop(&self, key: &str) -> KvResult<Option<String>> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(None),
            Some(entry) => match &mut entry.value {
                KvValue::List(list) => Ok(list.pop_back()),
                _ => Err(KvError::WrongType {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                KvValue::List(list) => {
                    match normalize_range(start, stop, list.len()) {
                        None => Ok(Vec::new()),
                        Some((lo, hi)) => {
                            Ok(list.iter().skip(lo).take(hi - lo + 1).cloned().collect())
                        }
                    }
                }
                _ => Err(KvError::WrongType {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn llen(&self, key: &str) -> KvResult<u64> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                KvValue::List(list) => Ok(list.len() as u64),
                _ => Err(KvError::WrongType {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> KvResult<()> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(()),
            Some(entry) => match &mut entry.value {
                KvValue::List(list) => {
                    match normalize_range(start, stop, list.len()) {
                        None => list.clear(),
                        Some((lo, hi)) => {
                            let kept: VecDeque<String> =
                                list.iter().skip(lo).take(hi - lo + 1).cloned().collect();
                            *list = kept;
                        }
                    }
                    Ok(())
                }
                _ => Err(KvError::WrongType {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> KvResult<u64> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(0),
            Some(entry) => match &mut entry.value {
                KvValue::List(list) => {
                    let mut removed = 0u64;
                    let budget = count.unsigned_abs();
                    if count >= 0 {
                        let mut kept = VecDeque::with_capacity(list.len());
                        for item in list.drain(..) {
                            if item == value && (count == 0 || removed < budget) {
                                removed += 1;
                            } else {
                                kept.push_back(item);
                            }
                        }
                        *list = kept;
                    } else {
                        let mut kept = VecDeque::with_capacity(list.len());
                        for item in list.drain(..).rev() {
                            if item == value && removed < budget {
                                removed += 1;
                            } else {
                                kept.push_front(item);
                            }
                        }
                        *list = kept;
                    }
                    Ok(removed)
                }
                _ => Err(KvError::WrongType {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn sadd(&self, key: &str, members: &[String]) -> KvResult<u64> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        let set = Self::set_entry(&mut map, key, now)?;
        let mut added = 0u64;
        for member in members {
            if set.insert(member.clone()) {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn srem(&self, key: &str, members: &[String]) -> KvResult<u64> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(0),
            Some(entry) => match &mut entry.value {
                KvValue::Set(set) => {
                    let mut removed = 0u64;
                    for member in members {
                        if set.remove(member) {
                            removed += 1;
                        }
                    }
                    Ok(removed)
                }
                _ => Err(KvError::WrongType {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                KvValue::Set(set) => Ok(set.iter().cloned().collect()),
                _ => Err(KvError::WrongType {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn sismember(&self, key: &str, member: &str) -> KvResult<bool> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(false),
            Some(entry) => match &entry.value {
                KvValue::Set(set) => Ok(set.contains(member)),
                _ => Err(KvError::WrongType {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn scard(&self, key: &str) -> KvResult<u64> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                KvValue::Set(set) => Ok(set.len() as u64),
                _ => Err(KvError::WrongType {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                KvValue::Hash(hash) => Ok(hash.get(field).cloned()),
                _ => Err(KvError::WrongType {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> KvResult<bool> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        let hash = Self::hash_entry(&mut map, key, now)?;
        Ok(hash.insert(field.to_string(), value.to_string()).is_none())
    }

    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(false),
            Some(entry) => match &mut entry.value {
                KvValue::Hash(hash) => Ok(hash.remove(field).is_some()),
                _ => Err(KvError::WrongType {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(HashMap::new()),
            Some(entry) => match &entry.value {
                KvValue::Hash(hash) => Ok(hash.clone()),
                _ => Err(KvError::WrongType {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        let now = self.clock.now();
        let mut map = self.entries.lock();
        map.retain(|_, entry| !entry.is_expired(now));
        Ok(map
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> KvResult<()> {
        Ok(())
    }

    async fn flushall(&self) -> KvResult<()> {
        self.entries.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ManualClock;
    use chrono::TimeZone;

    fn clocked() -> (MemoryKv, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap());
        let kv = MemoryKv::with_clock(Arc::new(clock.clone()));
        (kv, clock)
    }

    #[tokio::test]
    async fn strings_round_trip() {
        let (kv, _) = clocked();
        assert_eq!(kv.get("k").await.unwrap(), None);
        kv.set("k", "v", None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
        assert!(kv.delete("k").await.unwrap());
        assert!(!kv.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn expiry_is_observed_on_read() {
        let (kv, clock) = clocked();
        kv.set("k", "v", Some(10)).await.unwrap();
        assert!(kv.exists("k").await.unwrap());
        assert_eq!(kv.ttl("k").await.unwrap(), 10);

        clock.advance(Duration::seconds(11));
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(!kv.exists("k").await.unwrap());
        assert_eq!(kv.ttl("k").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn zero_ttl_means_no_expiry() {
        let (kv, clock) = clocked();
        kv.set("k", "v", Some(0)).await.unwrap();
        clock.advance(Duration::days(365));
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(kv.ttl("k").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn incr_initializes_and_counts() {
        let (kv, _) = clocked();
        assert_eq!(kv.incr("c").await.unwrap(), 1);
        assert_eq!(kv.incr("c").await.unwrap(), 2);
        assert_eq!(kv.incr_by("c", 5).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn incr_on_non_integer_fails() {
        let (kv, _) = clocked();
        kv.set("c", "not a number", None).await.unwrap();
        assert!(matches!(
            kv.incr("c").await,
            Err(KvError::NotInteger { .. })
        ));
    }

    #[tokio::test]
    async fn shape_mismatch_is_distinct_from_absent() {
        let (kv, _) = clocked();
        kv.rpush("l", &["a".into()]).await.unwrap();
        assert!(matches!(kv.get("l").await, Err(KvError::WrongType { .. })));
        assert!(matches!(
            kv.sadd("l", &["x".into()]).await,
            Err(KvError::WrongType { .. })
        ));
        // set() replaces any existing shape
        kv.set("l", "now a string", None).await.unwrap();
        assert_eq!(kv.get("l").await.unwrap(), Some("now a string".to_string()));
    }

    #[tokio::test]
    async fn list_semantics() {
        let (kv, _) = clocked();
        assert_eq!(
            kv.rpush("l", &["a".into(), "b".into(), "c".into()])
                .await
                .unwrap(),
            3
        );
        assert_eq!(kv.lpush("l", &["z".into()]).await.unwrap(), 4);
        assert_eq!(
            kv.lrange("l", 0, -1).await.unwrap(),
            vec!["z", "a", "b", "c"]
        );
        assert_eq!(kv.lrange("l", -2, -1).await.unwrap(), vec!["b", "c"]);
        assert_eq!(kv.lpop("l").await.unwrap(), Some("z".to_string()));
        assert_eq!(kv.rpop("l").await.unwrap(), Some("c".to_string()));
        assert_eq!(kv.llen("l").await.unwrap(), 2);

        kv.ltrim("l", 0, 0).await.unwrap();
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn lrem_head_tail_and_all() {
        let (kv, _) = clocked();
        let items: Vec<String> = ["x", "y", "x", "y", "x"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        kv.rpush("l", &items).await.unwrap();
        assert_eq!(kv.lrem("l", 1, "x").await.unwrap(), 1);
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), vec!["y", "x", "y", "x"]);
        assert_eq!(kv.lrem("l", -1, "x").await.unwrap(), 1);
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), vec!["y", "x", "y"]);
        assert_eq!(kv.lrem("l", 0, "y").await.unwrap(), 2);
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), vec!["x"]);
    }

    #[tokio::test]
    async fn set_semantics() {
        let (kv, _) = clocked();
        assert_eq!(kv.sadd("s", &["a".into(), "b".into()]).await.unwrap(), 2);
        assert_eq!(kv.sadd("s", &["b".into(), "c".into()]).await.unwrap(), 1);
        assert!(kv.sismember("s", "a").await.unwrap());
        assert!(!kv.sismember("s", "zz").await.unwrap());
        assert_eq!(kv.scard("s").await.unwrap(), 3);
        assert_eq!(kv.srem("s", &["a".into(), "zz".into()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn hash_semantics() {
        let (kv, _) = clocked();
        assert!(kv.hset("h", "f1", "v1").await.unwrap());
        assert!(!kv.hset("h", "f1", "v2").await.unwrap());
        assert_eq!(kv.hget("h", "f1").await.unwrap(), Some("v2".to_string()));
        assert_eq!(kv.hget("h", "nope").await.unwrap(), None);
        assert!(kv.hdel("h", "f1").await.unwrap());
        assert!(!kv.hdel("h", "f1").await.unwrap());
    }

    #[tokio::test]
    async fn set_nx_only_writes_once() {
        let (kv, clock) = clocked();
        assert!(kv.set_nx("claim", "w1", Some(60)).await.unwrap());
        assert!(!kv.set_nx("claim", "w2", Some(60)).await.unwrap());
        assert_eq!(kv.get("claim").await.unwrap(), Some("w1".to_string()));

        // After expiry the claim can be taken again.
        clock.advance(Duration::seconds(61));
        assert!(kv.set_nx("claim", "w3", Some(60)).await.unwrap());
    }

    #[tokio::test]
    async fn take_is_single_shot() {
        let (kv, _) = clocked();
        kv.set("tok", "userA", None).await.unwrap();
        assert_eq!(kv.take("tok").await.unwrap(), Some("userA".to_string()));
        assert_eq!(kv.take("tok").await.unwrap(), None);
        assert!(!kv.exists("tok").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_takes_yield_exactly_one_winner() {
        let kv = Arc::new(MemoryKv::new());
        kv.set("tok", "userA", None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move { kv.take("tok").await.unwrap() }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn keys_returns_matching_snapshot() {
        let (kv, _) = clocked();
        kv.set("rate:u1:60", "1", None).await.unwrap();
        kv.set("rate:u2:60", "4", None).await.unwrap();
        kv.set("block:u1", "x", None).await.unwrap();

        let mut keys = kv.keys("rate:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["rate:u1:60", "rate:u2:60"]);
    }

    #[tokio::test]
    async fn expire_applies_to_any_shape() {
        let (kv, clock) = clocked();
        kv.rpush("l", &["a".into()]).await.unwrap();
        assert!(kv.expire("l", 5).await.unwrap());
        assert!(!kv.expire("missing", 5).await.unwrap());

        clock.advance(Duration::seconds(6));
        assert_eq!(kv.llen("l").await.unwrap(), 0);
    }
}
