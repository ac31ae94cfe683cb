//! Redis KV backend.
//!
//! Thin mapping from the [`KvStore`] contract onto Redis commands over a
//! `ConnectionManager` (auto-reconnecting, cheap to clone per call).
//! Atomicity requirements map onto server-side primitives: `SET NX EX` for
//! set-if-absent, `GETDEL` for single-use reads, `INCRBY` for counters.
//! `keys` walks the keyspace with cursor `SCAN`, never a blocking `KEYS`.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind as RedisErrorKind, RedisError};

use super::{KvError, KvResult, KvStore};

/// Redis-backed [`KvStore`] implementation.
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    /// Connect to a Redis server, e.g. `redis://127.0.0.1:6379/0`.
    pub async fn connect(url: &str) -> KvResult<Self> {
        let client = redis::Client::open(url).map_err(map_err)?;
        let manager = ConnectionManager::new(client).await.map_err(map_err)?;
        tracing::debug!(url = %url, "connected redis kv backend");
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

/// Classify a Redis error without losing the absent/shape/backend split.
fn map_err(err: RedisError) -> KvError {
    if err.kind() == RedisErrorKind::TypeError || err.code() == Some("WRONGTYPE") {
        return KvError::WrongType {
            key: String::new(),
        };
    }
    let text = err.to_string();
    if text.contains("not an integer") {
        return KvError::NotInteger {
            key: String::new(),
        };
    }
    KvError::Backend(text)
}

fn map_err_keyed(err: RedisError, key: &str) -> KvError {
    match map_err(err) {
        KvError::WrongType { .. } => KvError::WrongType {
            key: key.to_string(),
        },
        KvError::NotInteger { .. } => KvError::NotInteger {
            key: key.to_string(),
        },
        other => other,
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> KvResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(secs) = ttl_secs.filter(|s| *s > 0) {
            cmd.arg("EX").arg(secs);
        }
        cmd.query_async::<_, ()>(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> KvResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(secs) = ttl_secs.filter(|s| *s > 0) {
            cmd.arg("EX").arg(secs);
        }
        let reply: Option<String> = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))?;
        Ok(reply.is_some())
    }

    async fn take(&self, key: &str) -> KvResult<Option<String>> {
        redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        let n: u64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))?;
        Ok(n > 0)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> KvResult<bool> {
        let applied: u64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))?;
        Ok(applied > 0)
    }

    async fn ttl(&self, key: &str) -> KvResult<i64> {
        redis::cmd("TTL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn incr(&self, key: &str) -> KvResult<i64> {
        self.incr_by(key, 1).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64> {
        redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn lpush(&self, key: &str, values: &[String]) -> KvResult<u64> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        redis::cmd("LPUSH")
            .arg(key)
            .arg(values)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn rpush(&self, key: &str, values: &[String]) -> KvResult<u64> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        redis::cmd("RPUSH")
            .arg(key)
            .arg(values)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn lpop(&self, key: &str) -> KvResult<Option<String>> {
        redis::cmd("LPOP")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn rpop(&self, key: &str) -> KvResult<Option<String>> {
        redis::cmd("RPOP")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>> {
        redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn llen(&self, key: &str) -> KvResult<u64> {
        redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> KvResult<()> {
        redis::cmd("LTRIM")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async::<_, ()>(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> KvResult<u64> {
        redis::cmd("LREM")
            .arg(key)
            .arg(count)
            .arg(value)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn sadd(&self, key: &str, members: &[String]) -> KvResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        redis::cmd("SADD")
            .arg(key)
            .arg(members)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn srem(&self, key: &str, members: &[String]) -> KvResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        redis::cmd("SREM")
            .arg(key)
            .arg(members)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn sismember(&self, key: &str, member: &str) -> KvResult<bool> {
        let n: u64 = redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))?;
        Ok(n > 0)
    }

    async fn scard(&self, key: &str) -> KvResult<u64> {
        redis::cmd("SCARD")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> KvResult<bool> {
        let created: u64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))?;
        Ok(created > 0)
    }

    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool> {
        let removed: u64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))?;
        Ok(removed > 0)
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err_keyed(e, key))
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut out = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            out.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(out)
    }

    async fn ping(&self) -> KvResult<()> {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn())
            .await
            .map(|_| ())
            .map_err(map_err)
    }

    async fn flushall(&self) -> KvResult<()> {
        redis::cmd("FLUSHALL")
            .query_async::<_, ()>(&mut self.conn())
            .await
            .map_err(map_err)
    }
}
