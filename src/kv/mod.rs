//! KV Backend Abstraction.
//!
//! A narrow set of atomic primitives shared by every other subsystem,
//! presented behind one [`KvBackend`] trait with two implementors: a
//! networked [`redis_backend::RedisBackend`] and a single-host
//! [`file_backend::FileBackend`] fallback. Nothing above this module talks
//! to Redis or the filesystem directly.

mod file_backend;
pub mod keys;
mod redis_backend;

pub use file_backend::FileBackend;
pub use redis_backend::RedisBackend;

use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

/// One entry popped from a sorted set: member and its score.
pub type ScoredMember = (String, f64);

/// Narrow atomic KV interface. Every method is expected to be fast and
/// non-throwing except when the backend itself is unreachable
/// (`CoordError::BackendUnavailable`) — see "Failure semantics".
///
/// Two operations genuinely ask for server-side scripting: task claim and
/// lock acquire. Task claim is implemented above
/// this trait using [`KvBackend::zrem`]'s atomic remove-and-report-whether-
/// present semantics (no scripting needed: a sorted set member can only be
/// removed once, so "did my `zrem` return true" *is* the compare-and-claim).
/// Lock acquire genuinely needs a check-then-set in one round trip, so it
/// gets its own scripted primitive: [`KvBackend::try_acquire_lock`].
#[async_trait]
pub trait KvBackend: Send + Sync {
    // -- plain string ops --
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn cas_set(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool>;
    async fn incrby(&self, key: &str, n: i64) -> Result<i64>;

    async fn incr(&self, key: &str) -> Result<i64> {
        self.incrby(key, 1).await
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.incrby(key, -1).await
    }

    // -- hash ops --
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;
    async fn hincrby(&self, key: &str, field: &str, n: i64) -> Result<i64>;

    // -- set ops --
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<HashSet<String>>;

    // -- sorted set ops --
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()>;
    /// Atomic remove; returns whether `member` was actually present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    async fn zcard(&self, key: &str) -> Result<usize>;
    /// Members with `min <= score <= max`, ascending, capped at `limit`.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredMember>>;
    /// Pop and return the lowest-scoring member, if any.
    async fn zpopmin(&self, key: &str) -> Result<Option<ScoredMember>>;

    // -- lock acquire: the one operation that needs a real check-then-set --
    /// Atomically acquire a lock if no live one exists. `value` is the
    /// serialized [`crate::models::FileLock`] to store; `expires_at_epoch_ms`
    /// is that same record's `expires_at` restated as an epoch so the
    /// backend never has to reparse a timestamp back out of `value`'s
    /// serialization format. The "live iff `expires_at > now`" invariant in
    /// holds for both backends identically.
    async fn try_acquire_lock(
        &self,
        key: &str,
        value: &str,
        now_epoch_ms: i64,
        expires_at_epoch_ms: i64,
    ) -> Result<bool>;

    // -- streams (audit log) --
    /// Append `value` under `topic`, returning the assigned monotonic id.
    async fn stream_append(&self, topic: &str, value: &str) -> Result<u64>;
    /// Entries with id strictly greater than `cursor`, in id order.
    async fn stream_read(
        &self,
        topic: &str,
        cursor: u64,
        limit: Option<usize>,
    ) -> Result<Vec<(u64, String)>>;

    // -- pub/sub --
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
    /// Subscribe to `channel`, returning a receiver fed as messages arrive.
    /// Best-effort and at-most-once, matching `publish`: a subscriber that
    /// isn't listening yet (or drops its receiver) simply misses messages
    /// published in the meantime, the same fire-and-forget contract real
    /// Redis pub/sub gives callers.
    async fn subscribe(&self, channel: &str) -> Result<tokio::sync::mpsc::Receiver<String>>;
}
