//! In-process file-backed fallback.
//!
//! Used when no networked KV is reachable. Treated as a first-class
//! backend per the design note, not a degraded-mode hack: it implements
//! the exact same [`super::KvBackend`] trait and is the backend the test
//! suite exercises S1-S6 and the ten universal invariants against (
//! property 10, fallback parity).
//!
//! Every key/value/hash/set/sorted-set lives as one JSON file under a
//! subdirectory chosen by key prefix (`tasks/`, `locks/`, `agents/`,
//! `approvals/`, `board/`, `misc/`); streams are one JSONL file per topic
//! under `audit/`. Writes go through create-new-then-rename so a reader
//! never observes a half-written file. Since the fallback's contract is
//! single-host, single-process-group correctness (not cross-process safety
//! on top of a shared directory), a single [`tokio::sync::Mutex`] around
//! the in-memory mirror stands in for the OS file lock `scoped_lock` would
//! otherwise take per mutating op.

use super::{KvBackend, ScoredMember};
use crate::error::CoordError;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredValue {
    /// The original KV key, carried inside the payload (rather than
    /// recovered from the filesystem-safe encoded filename) so `open`
    /// can rebuild the in-memory map verbatim after a restart.
    #[serde(default)]
    key: String,
    scalar: Option<String>,
    hash: HashMap<String, String>,
    set: HashSet<String>,
    #[serde(default)]
    zset: Vec<ScoredMember>,
}

impl StoredValue {
    fn zset_sorted(&self) -> Vec<ScoredMember> {
        let mut v = self.zset.clone();
        v.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(a.0.cmp(&b.0)));
        v
    }
}

/// Single-host, file-backed implementation of [`KvBackend`].
pub struct FileBackend {
    root: PathBuf,
    state: Mutex<HashMap<String, StoredValue>>,
    /// Per-topic append cursor for stream emulation; guarded separately
    /// from `state` since it's only ever touched by audit-log writers.
    stream_seq: StdMutex<HashMap<String, u64>>,
    /// In-process stand-in for Redis pub/sub fan-out: every live
    /// `subscribe` receiver's sender, keyed by channel.
    subscribers: StdMutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
}

impl FileBackend {
    /// Open (creating if absent) a fallback rooted at `dir`, loading any
    /// state left behind by a previous process so restarts don't lose
    /// tasks/locks/agents.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let root = dir.into();
        for sub in ["tasks", "locks", "agents", "approvals", "board", "audit", "misc"] {
            tokio::fs::create_dir_all(root.join(sub))
            .await
            .map_err(|e| {
                    CoordError::backend_unavailable(format!(
                            "cannot create fallback directory {}: {e}",
                            root.join(sub).display()
                    ))
            })?;
        }

        let mut state = HashMap::new();
        let mut stream_seq = HashMap::new();
        for sub in ["tasks", "locks", "agents", "approvals", "board", "misc"] {
            let dir = root.join(sub);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Ok(bytes) = tokio::fs::read(&path).await {
                    if let Ok(value) = serde_json::from_slice::<StoredValue>(&bytes) {
                        if !value.key.is_empty() {
                            state.insert(value.key.clone(), value);
                        }
                    }
                }
            }
        }

        let audit_dir = root.join("audit");
        if let Ok(mut entries) = tokio::fs::read_dir(&audit_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let mut last = 0u64;
                let mut topic = None;
                if let Ok(text) = tokio::fs::read_to_string(&path).await {
                    for line in text.lines() {
                        if let Ok(entry) = serde_json::from_str::<StreamLine>(line) {
                            last = last.max(entry.id);
                            topic = Some(entry.topic);
                        }
                    }
                }
                if let Some(topic) = topic {
                    stream_seq.insert(topic, last);
                }
            }
        }

        Ok(Self {
                root,
                state: Mutex::new(state),
                stream_seq: StdMutex::new(stream_seq),
                subscribers: StdMutex::new(HashMap::new()),
        })
    }

    fn subdir_for(key: &str) -> &'static str {
        if key.starts_with("task:") || key.starts_with("tasks:") {
            "tasks"
        } else if key.starts_with("lock") {
            "locks"
        } else if key.starts_with("agent") {
            "agents"
        } else if key.starts_with("approval") {
            "approvals"
        } else if key.starts_with("board:") {
            "board"
        } else {
            "misc"
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root
        .join(Self::subdir_for(key))
        .join(format!("{}.json", encode_filename(key)))
    }

    async fn persist(&self, key: &str, value: &StoredValue) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let mut value = value.clone();
        value.key = key.to_string();
        let bytes = serde_json::to_vec_pretty(&value)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove_file(&self, key: &str) {
        let _ = tokio::fs::remove_file(self.path_for(key)).await;
    }

    fn stream_path(&self, topic: &str) -> PathBuf {
        self.root
        .join("audit")
        .join(format!("{}.jsonl", encode_filename(topic)))
    }
}

#[derive(Serialize, Deserialize)]
struct StreamLine {
    id: u64,
    topic: String,
    value: String,
}

fn encode_filename(key: &str) -> String {
    key.chars()
    .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
    .collect::<String>()
    + "__"
    + &format!("{:x}", simple_hash(key))
}

fn simple_hash(s: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

#[async_trait]
impl KvBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(state.get(key).and_then(|v| v.scalar.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state.entry(key.to_string()).or_default();
        entry.scalar = Some(value.to_string());
        self.persist(key, entry).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.remove(key);
        self.remove_file(key).await;
        Ok(())
    }

    async fn cas_set(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let entry = state.entry(key.to_string()).or_default();
        if entry.scalar.as_deref() != expected {
            return Ok(false);
        }
        entry.scalar = Some(new.to_string());
        let snapshot = entry.clone();
        drop(state);
        self.persist(key, &snapshot).await?;
        Ok(true)
    }

    async fn incrby(&self, key: &str, n: i64) -> Result<i64> {
        let mut state = self.state.lock().await;
        let entry = state.entry(key.to_string()).or_default();
        let current: i64 = entry
        .scalar
        .as_deref()
        .unwrap_or("0")
        .parse()
        .unwrap_or(0);
        let updated = current + n;
        entry.scalar = Some(updated.to_string());
        let snapshot = entry.clone();
        drop(state);
        self.persist(key, &snapshot).await?;
        Ok(updated)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state.entry(key.to_string()).or_default();
        entry.hash.insert(field.to_string(), value.to_string());
        let snapshot = entry.clone();
        drop(state);
        self.persist(key, &snapshot).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(state.get(key).and_then(|v| v.hash.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let state = self.state.lock().await;
        Ok(state.get(key).map(|v| v.hash.clone()).unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(key) {
            entry.hash.remove(field);
            let snapshot = entry.clone();
            drop(state);
            self.persist(key, &snapshot).await?;
        }
        Ok(())
    }

    async fn hincrby(&self, key: &str, field: &str, n: i64) -> Result<i64> {
        let mut state = self.state.lock().await;
        let entry = state.entry(key.to_string()).or_default();
        let current: i64 = entry.hash.get(field).and_then(|s| s.parse().ok()).unwrap_or(0);
        let updated = current + n;
        entry.hash.insert(field.to_string(), updated.to_string());
        let snapshot = entry.clone();
        drop(state);
        self.persist(key, &snapshot).await?;
        Ok(updated)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state.entry(key.to_string()).or_default();
        entry.set.insert(member.to_string());
        let snapshot = entry.clone();
        drop(state);
        self.persist(key, &snapshot).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(key) {
            entry.set.remove(member);
            let snapshot = entry.clone();
            drop(state);
            self.persist(key, &snapshot).await?;
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
        let state = self.state.lock().await;
        Ok(state.get(key).map(|v| v.set.clone()).unwrap_or_default())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state.entry(key.to_string()).or_default();
        entry.zset.retain(|(m, _)| m != member);
        entry.zset.push((member.to_string(), score));
        let snapshot = entry.clone();
        drop(state);
        self.persist(key, &snapshot).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.get_mut(key) else {
            return Ok(false);
        };
        let before = entry.zset.len();
        entry.zset.retain(|(m, _)| m != member);
        let removed = entry.zset.len() != before;
        if removed {
            let snapshot = entry.clone();
            drop(state);
            self.persist(key, &snapshot).await?;
        }
        Ok(removed)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let state = self.state.lock().await;
        Ok(state
            .get(key)
            .and_then(|v| v.zset.iter().find(|(m, _)| m == member).map(|(_, s)| *s)))
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.get(key).map(|v| v.zset.len()).unwrap_or(0))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredMember>> {
        let state = self.state.lock().await;
        let Some(entry) = state.get(key) else {
            return Ok(Vec::new());
        };
        let mut sorted = entry.zset_sorted();
        sorted.retain(|(_, s)| *s >= min && *s <= max);
        if let Some(limit) = limit {
            sorted.truncate(limit);
        }
        Ok(sorted)
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<ScoredMember>> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.get_mut(key) else {
            return Ok(None);
        };
        let sorted = entry.zset_sorted();
        let Some((member, score)) = sorted.into_iter().next() else {
            return Ok(None);
        };
        entry.zset.retain(|(m, _)| m != &member);
        let snapshot = entry.clone();
        drop(state);
        self.persist(key, &snapshot).await?;
        Ok(Some((member, score)))
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        value: &str,
        now_epoch_ms: i64,
        expires_at_epoch_ms: i64,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let entry = state.entry(key.to_string()).or_default();
        let live = entry
        .hash
        .get("expires_at_epoch_ms")
        .and_then(|s| s.parse::<i64>().ok())
        .map(|expires| expires > now_epoch_ms)
        .unwrap_or(false);
        if live {
            return Ok(false);
        }
        entry.hash.clear();
        entry.hash.insert("record".to_string(), value.to_string());
        entry
        .hash
        .insert("expires_at_epoch_ms".to_string(), expires_at_epoch_ms.to_string());
        let snapshot = entry.clone();
        drop(state);
        self.persist(key, &snapshot).await?;
        Ok(true)
    }

    async fn stream_append(&self, topic: &str, value: &str) -> Result<u64> {
        let id = {
            let mut seq = self.stream_seq.lock().unwrap();
            let next = seq.get(topic).copied().unwrap_or(0) + 1;
            seq.insert(topic.to_string(), next);
            next
        };
        let line = serde_json::to_string(&StreamLine {
                id,
                topic: topic.to_string(),
                value: value.to_string(),
        })?;
        let path = self.stream_path(topic);
        let mut existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        existing.push_str(&line);
        existing.push('\n');
        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, existing.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(id)
    }

    async fn stream_read(
        &self,
        topic: &str,
        cursor: u64,
        limit: Option<usize>,
    ) -> Result<Vec<(u64, String)>> {
        let path = self.stream_path(topic);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(_) => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        for line in text.lines() {
            if let Ok(entry) = serde_json::from_str::<StreamLine>(line) {
                if entry.id > cursor {
                    out.push((entry.id, entry.value));
                    if let Some(limit) = limit {
                        if out.len() >= limit {
                            break;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(senders) = subscribers.get_mut(channel) {
            senders.retain(|tx| !matches!(
                tx.try_send(message.to_string()),
                Err(mpsc::error::TrySendError::Closed(_))
            ));
        }
        Ok(())
    }

    /// In-process pub/sub emulation: a new bounded channel is registered
    /// under `channel` and every later `publish` to it is fanned out here.
    /// A full receiver drops the message rather than blocking the
    /// publisher, matching pub/sub's at-most-once contract.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(128);
        self.subscribers
        .lock()
        .unwrap()
        .entry(channel.to_string())
        .or_default()
        .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> FileBackend {
        let dir = tempfile::tempdir().unwrap();
        FileBackend::open(dir.into_path()).await.unwrap()
    }

    #[tokio::test]
    async fn scalar_roundtrip() {
        let kv = backend().await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        kv.set("k", "v").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn cas_set_only_succeeds_on_match() {
        let kv = backend().await;
        kv.set("k", "v1").await.unwrap();
        assert!(!kv.cas_set("k", Some("wrong"), "v2").await.unwrap());
        assert!(kv.cas_set("k", Some("v1"), "v2").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some("v2".to_string()));
    }

    #[tokio::test]
    async fn zset_orders_by_score_then_member() {
        let kv = backend().await;
        kv.zadd("z", 5.0, "b").await.unwrap();
        kv.zadd("z", 5.0, "a").await.unwrap();
        kv.zadd("z", 1.0, "c").await.unwrap();
        let range = kv.zrange_by_score("z", f64::MIN, f64::MAX, None).await.unwrap();
        assert_eq!(
            range,
            vec![("c".to_string(), 1.0), ("a".to_string(), 5.0), ("b".to_string(), 5.0)]
        );
    }

    #[tokio::test]
    async fn zrem_reports_whether_member_was_present() {
        let kv = backend().await;
        kv.zadd("z", 1.0, "a").await.unwrap();
        assert!(kv.zrem("z", "a").await.unwrap());
        assert!(!kv.zrem("z", "a").await.unwrap());
    }

    #[tokio::test]
    async fn lock_acquire_respects_expiry() {
        let kv = backend().await;
        let value = serde_json::json!({ "expires_at_epoch_ms": 1000 }).to_string();
        assert!(kv.try_acquire_lock("lock:p", &value, 0, 1000).await.unwrap());
        // still live
        assert!(!kv.try_acquire_lock("lock:p", &value, 500, 2000).await.unwrap());
        // now expired
        assert!(kv.try_acquire_lock("lock:p", &value, 1500, 2500).await.unwrap());
    }

    #[tokio::test]
    async fn stream_append_and_read_from_cursor() {
        let kv = backend().await;
        let id1 = kv.stream_append("topic", "e1").await.unwrap();
        let id2 = kv.stream_append("topic", "e2").await.unwrap();
        assert_eq!(id1 + 1, id2);
        let entries = kv.stream_read("topic", id1, None).await.unwrap();
        assert_eq!(entries, vec![(id2, "e2".to_string())]);
    }

    #[tokio::test]
    async fn subscribe_receives_messages_published_after_it_joined() {
        let kv = backend().await;
        let mut rx = kv.subscribe("channel:escalations").await.unwrap();
        kv.publish("channel:escalations", "task escalated").await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, "task escalated");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_not_an_error() {
        let kv = backend().await;
        kv.publish("channel:nobody-listening", "hello").await.unwrap();
    }
}
