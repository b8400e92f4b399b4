//! Networked KV backend, backed by Redis via the `redis` crate's
//! `ConnectionManager` (auto-reconnecting, safe to clone and share across
//! tasks) and `tokio-comp` for the async runtime. The `script` feature
//! supplies the one genuinely scripted primitive this crate needs:
//! [`RedisBackend::try_acquire_lock`], a check-then-set that must happen in
//! a single round trip.

use super::{KvBackend, ScoredMember};
use crate::error::CoordError;
use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;

/// `GET` the lock hash's `expires_at_epoch_ms`; if absent or `<= now`,
/// overwrite the hash with the new record and refresh its key-level TTL so
/// an orphaned lock still eventually vanishes from Redis even if no reader
/// ever calls `list_locks`. Returns 1 on success, 0 if a live lock exists.
const LOCK_ACQUIRE_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'expires_at_epoch_ms')
local now = tonumber(ARGV[1])
if current and tonumber(current) > now then
 return 0
end
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'record', ARGV[2], 'expires_at_epoch_ms', ARGV[3])
redis.call('PEXPIREAT', KEYS[1], ARGV[3])
return 1
"#;

pub struct RedisBackend {
    client: redis::Client,
    conn: ConnectionManager,
    lock_script: Script,
}

impl RedisBackend {
    /// Connect to `redis_url`, verifying reachability with a `PING` before
    /// returning so session startup can fall back to the file backend on
    /// `BackendUnavailable` instead of discovering it on the first real
    /// operation.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
        .map_err(|e| CoordError::backend_unavailable(format!("invalid REDIS_URL: {e}")))?;
        let mut conn = ConnectionManager::new(client.clone())
        .await
        .map_err(|e| CoordError::backend_unavailable(format!("cannot reach redis: {e}")))?;
        let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| CoordError::backend_unavailable(format!("redis PING failed: {e}")))?;
        Ok(Self {
                client,
                conn,
                lock_script: Script::new(LOCK_ACQUIRE_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _: () = self.conn().set(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _: () = self.conn().del(key).await?;
        Ok(())
    }

    async fn cas_set(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool> {
        const SCRIPT: &str = r#"
 local current = redis.call('GET', KEYS[1])
 if current == ARGV[1] then
 redis.call('SET', KEYS[1], ARGV[2])
 return 1
 end
 if current == false and ARGV[1] == '' then
 redis.call('SET', KEYS[1], ARGV[2])
 return 1
 end
 return 0
 "#;
        let expected_arg = expected.unwrap_or("");
        let result: i32 = Script::new(SCRIPT)
        .key(key)
        .arg(expected_arg)
        .arg(new)
        .invoke_async(&mut self.conn())
        .await?;
        Ok(result == 1)
    }

    async fn incrby(&self, key: &str, n: i64) -> Result<i64> {
        Ok(self.conn().incr(key, n).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: () = self.conn().hset(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.conn().hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.conn().hgetall(key).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let _: () = self.conn().hdel(key, field).await?;
        Ok(())
    }

    async fn hincrby(&self, key: &str, field: &str, n: i64) -> Result<i64> {
        Ok(self.conn().hincr(key, field, n).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let _: () = self.conn().sadd(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let _: () = self.conn().srem(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
        Ok(self.conn().smembers(key).await?)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let _: () = self.conn().zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = self.conn().zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        Ok(self.conn().zscore(key, member).await?)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        Ok(self.conn().zcard(key).await?)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredMember>> {
        let members: Vec<(String, f64)> = match limit {
            Some(limit) => {
                self.conn()
                .zrangebyscore_limit_withscores(key, min, max, 0, limit as isize)
                .await?
            }
            None => self.conn().zrangebyscore_withscores(key, min, max).await?,
        };
        Ok(members)
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<ScoredMember>> {
        let popped: Vec<(String, f64)> = self.conn().zpopmin(key, 1).await?;
        Ok(popped.into_iter().next())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        value: &str,
        now_epoch_ms: i64,
        expires_at_epoch_ms: i64,
    ) -> Result<bool> {
        let result: i32 = self
        .lock_script
        .key(key)
        .arg(now_epoch_ms)
        .arg(value)
        .arg(expires_at_epoch_ms)
        .invoke_async(&mut self.conn())
        .await?;
        Ok(result == 1)
    }

    async fn stream_append(&self, topic: &str, value: &str) -> Result<u64> {
        let seq_key = format!("{topic}:seq");
        let id: i64 = self.conn().incr(&seq_key, 1).await?;
        let zkey = format!("{topic}:entries");
        let payload = serde_json::to_string(&(id, value))?;
        let _: () = self.conn().zadd(&zkey, payload, id).await?;
        Ok(id as u64)
    }

    async fn stream_read(
        &self,
        topic: &str,
        cursor: u64,
        limit: Option<usize>,
    ) -> Result<Vec<(u64, String)>> {
        let zkey = format!("{topic}:entries");
        let raw = self
        .zrange_by_score(&zkey, (cursor + 1) as f64, f64::MAX, limit)
        .await?;
        let mut out = Vec::with_capacity(raw.len());
        for (payload, _score) in raw {
            if let Ok((id, value)) = serde_json::from_str::<(u64, String)>(&payload) {
                out.push((id, value));
            }
        }
        Ok(out)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let _: () = self.conn().publish(channel, message).await?;
        Ok(())
    }

    /// Opens a dedicated pub/sub connection (the `ConnectionManager` used
    /// for every other op cannot itself enter subscribe mode) and forwards
    /// payloads onto a bounded channel from a detached task for the
    /// lifetime of the returned receiver.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self
        .client
        .get_async_pubsub()
        .await
        .map_err(|e| CoordError::backend_unavailable(format!("cannot open redis pubsub: {e}")))?;
        pubsub
        .subscribe(channel)
        .await
        .map_err(|e| CoordError::backend_unavailable(format!("redis SUBSCRIBE failed: {e}")))?;

        let (tx, rx) = mpsc::channel(128);
        tokio::spawn(async move {
                let mut stream = pubsub.into_on_message();
                while let Some(msg) = stream.next().await {
                    let Ok(payload) = msg.get_payload::<String>() else {
                        continue;
                    };
                    if tx.send(payload).await.is_err() {
                        break;
                    }
                }
        });
        Ok(rx)
    }
}
