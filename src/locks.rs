//! File Lock Manager.
//!
//! Exclusive, TTL-bounded locks on file paths, acquired through the one
//! genuinely scripted KV primitive ([`KvBackend::try_acquire_lock`]) so two
//! concurrent acquirers on the same path can never both succeed.
//! [`ScopedLock`] is the canonical usage: acquire on entry, release on every
//! exit path including panics, always reconciling state even on the failure
//! path.

use crate::audit::AuditLog;
use crate::error::CoordError;
use crate::ids::{AgentId, LockId};
use crate::kv::{keys, KvBackend};
use crate::models::FileLock;
use crate::Result;
use chrono::{Duration, Utc};
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::{info, warn};

const LOCKS_INDEX: &str = "locks:index";

#[derive(Clone)]
pub struct FileLockManager {
    kv: Arc<dyn KvBackend>,
    audit: AuditLog,
    default_ttl_seconds: u64,
}

/// Lexical normalization of `path` (no filesystem access — the path need
/// not exist yet when a lock is requested for it). Collapses `.`/`..`
/// components so `a/./b` and `a/b` key the same lock.
fn canonicalize(path: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
            Component::RootDir => parts.insert(0, String::new()),
            Component::Prefix(p) => parts.push(p.as_os_str().to_string_lossy().into_owned()),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        parts.join("/")
    }
}

impl FileLockManager {
    pub fn new(kv: Arc<dyn KvBackend>, default_ttl_seconds: u64) -> Self {
        Self {
            audit: AuditLog::new(kv.clone()),
            kv,
            default_ttl_seconds,
        }
    }

    /// Acquire an exclusive lock on `path`. Does not queue: a busy lock
    /// fails immediately with `LockBusy`, and it is the caller's choice
    /// whether to retry.
    pub async fn lock_file(
        &self,
        path: &str,
        intent: impl Into<String>,
        holder: AgentId,
        ttl_seconds: Option<u64>,
    ) -> Result<LockId> {
        let canonical = canonicalize(path);
        let ttl = ttl_seconds.unwrap_or(self.default_ttl_seconds);
        let now = Utc::now();
        let lock = FileLock {
            path: canonical.clone(),
            holder,
            intent: intent.into(),
            lock_id: LockId::new(),
            acquired_at: now,
            expires_at: now + Duration::seconds(ttl as i64),
        };
        let payload = serde_json::to_string(&lock)?;
        let key = keys::lock(&canonical);
        let acquired = self
        .kv
        .try_acquire_lock(&key, &payload, now.timestamp_millis(), lock.expires_at.timestamp_millis())
        .await?;

        if !acquired {
            let existing = self.read_lock(&canonical).await?;
            let holder_desc = existing
            .map(|l| l.holder.to_string())
            .unwrap_or_else(|| "unknown".to_string());
            self.audit
            .record(
                Some(holder),
                "lock_denied",
                canonical.clone(),
                format!("held by {holder_desc}"),
            )
            .await?;
            return Err(CoordError::LockBusy {
                    path: canonical,
                    holder: holder_desc,
            });
        }

        self.kv
        .set(&keys::lock_owner(lock.lock_id), &canonical)
        .await?;
        self.kv.sadd(LOCKS_INDEX, &canonical).await?;
        info!(path = %canonical, lock_id = %lock.lock_id, holder = %holder, "lock acquired");
        Ok(lock.lock_id)
    }

    async fn read_lock(&self, canonical_path: &str) -> Result<Option<FileLock>> {
        let raw = self.kv.hget(&keys::lock(canonical_path), "record").await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn path_for_lock_id(&self, lock_id: LockId) -> Result<Option<String>> {
        self.kv.get(&keys::lock_owner(lock_id)).await
    }

    /// Extend the TTL of a still-held lock. Fails with `LockStolen` if the
    /// stored `lock_id` no longer matches — e.g. the TTL already expired
    /// and another agent acquired in the interim.
    pub async fn extend_lock(&self, lock_id: LockId, additional_seconds: u64) -> Result<()> {
        let Some(path) = self.path_for_lock_id(lock_id).await? else {
            return Err(CoordError::LockStolen(lock_id.to_string()));
        };
        let Some(mut lock) = self.read_lock(&path).await? else {
            return Err(CoordError::LockStolen(lock_id.to_string()));
        };
        if lock.lock_id != lock_id || !lock.is_live(Utc::now()) {
            return Err(CoordError::LockStolen(lock_id.to_string()));
        }
        lock.expires_at += Duration::seconds(additional_seconds as i64);
        let payload = serde_json::to_string(&lock)?;
        self.kv
        .hset(&keys::lock(&path), "record", &payload)
        .await?;
        self.kv
        .hset(
            &keys::lock(&path),
            "expires_at_epoch_ms",
            &lock.expires_at.timestamp_millis().to_string(),
        )
        .await?;
        Ok(())
    }

    /// Best-effort release: no error if the lock already expired or was
    /// stolen by someone else.
    pub async fn release_lock(&self, lock_id: LockId) -> Result<()> {
        let Some(path) = self.path_for_lock_id(lock_id).await? else {
            return Ok(());
        };
        if let Some(lock) = self.read_lock(&path).await? {
            if lock.lock_id == lock_id {
                self.kv.delete(&keys::lock(&path)).await?;
                info!(path = %path, lock_id = %lock_id, "lock released");
            }
        }
        self.kv.delete(&keys::lock_owner(lock_id)).await?;
        Ok(())
    }

    /// All live locks, consulting `LOCKS_INDEX` — a set of every path ever
    /// locked, which accumulates paths that have since been released or
    /// expired (stale entries are filtered here, not reaped eagerly; the
    /// index trades a little unbounded growth for never missing a live
    /// lock, matching the CLI requirement to list locks).
    pub async fn list_locks(&self) -> Result<Vec<FileLock>> {
        let paths = self.kv.smembers(LOCKS_INDEX).await?;
        let now = Utc::now();
        let mut out = Vec::new();
        for path in paths {
            if let Some(lock) = self.read_lock(&path).await? {
                if lock.is_live(now) {
                    out.push(lock);
                }
            }
        }
        out.sort_by_key(|l| l.acquired_at);
        Ok(out)
    }

    pub async fn scoped_lock(
        self_arc: &Arc<FileLockManager>,
        path: &str,
        intent: impl Into<String>,
        holder: AgentId,
        ttl_seconds: Option<u64>,
    ) -> Result<ScopedLock> {
        let lock_id = self_arc
        .lock_file(path, intent, holder, ttl_seconds)
        .await?;
        Ok(ScopedLock {
                manager: self_arc.clone(),
                lock_id: Some(lock_id),
        })
    }
}

/// RAII guard returned by [`FileLockManager::scoped_lock`]. Releasing is
/// guaranteed on every exit path: `Drop` spawns a detached best-effort
/// release task so the lock still goes away even if the guard is dropped
/// during a panic unwind, where we cannot `.await`.
pub struct ScopedLock {
    manager: Arc<FileLockManager>,
    lock_id: Option<LockId>,
}

impl ScopedLock {
    pub fn lock_id(&self) -> LockId {
        self.lock_id.expect("ScopedLock always holds a lock_id until dropped")
    }

    /// Release early and deterministically, awaiting completion instead of
    /// relying on the `Drop` fire-and-forget path.
    pub async fn release(mut self) -> Result<()> {
        if let Some(lock_id) = self.lock_id.take() {
            self.manager.release_lock(lock_id).await?;
        }
        Ok(())
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        if let Some(lock_id) = self.lock_id.take() {
            let manager = self.manager.clone();
            tokio::spawn(async move {
                    if let Err(e) = manager.release_lock(lock_id).await {
                        warn!(lock_id = %lock_id, error = %e, "best-effort scoped lock release failed");
                    }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::FileBackend;

    async fn manager() -> Arc<FileLockManager> {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(FileBackend::open(dir.into_path()).await.unwrap());
        Arc::new(FileLockManager::new(kv, 600))
    }

    #[tokio::test]
    async fn exclusive_acquire_then_busy() {
        let mgr = manager().await;
        let a = AgentId::new();
        let b = AgentId::new();
        let lock_id = mgr.lock_file("src/main.rs", "edit", a, None).await.unwrap();
        let err = mgr.lock_file("src/main.rs", "edit", b, None).await.unwrap_err();
        assert!(matches!(err, CoordError::LockBusy {.. }));
        mgr.release_lock(lock_id).await.unwrap();
        assert!(mgr.lock_file("src/main.rs", "edit", b, None).await.is_ok());
    }

    #[tokio::test]
    async fn ttl_expiry_allows_new_acquire_without_release() {
        let mgr = manager().await;
        let a = AgentId::new();
        let b = AgentId::new();
        mgr.lock_file("f.txt", "edit", a, Some(0)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(mgr.lock_file("f.txt", "edit", b, None).await.is_ok());
    }

    #[tokio::test]
    async fn release_leaves_no_lock_state() {
        let mgr = manager().await;
        let a = AgentId::new();
        let lock_id = mgr.lock_file("g.txt", "edit", a, None).await.unwrap();
        mgr.release_lock(lock_id).await.unwrap();
        assert!(mgr.read_lock(&canonicalize("g.txt")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn extend_fails_after_lock_stolen() {
        let mgr = manager().await;
        let a = AgentId::new();
        let b = AgentId::new();
        let lock_id = mgr.lock_file("h.txt", "edit", a, Some(0)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        mgr.lock_file("h.txt", "edit", b, None).await.unwrap();
        let err = mgr.extend_lock(lock_id, 60).await.unwrap_err();
        assert!(matches!(err, CoordError::LockStolen(_)));
    }

    #[tokio::test]
    async fn list_locks_reports_only_live_ones() {
        let mgr = manager().await;
        let a = AgentId::new();
        let lock_id = mgr.lock_file("j.txt", "edit", a, Some(0)).await.unwrap();
        mgr.lock_file("k.txt", "edit", a, None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let locks = mgr.list_locks().await.unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].path, canonicalize("k.txt"));
        let _ = lock_id;
    }

    #[tokio::test]
    async fn scoped_lock_releases_on_drop() {
        let mgr = manager().await;
        let a = AgentId::new();
        {
            let _guard = FileLockManager::scoped_lock(&mgr, "i.txt", "edit", a, None)
            .await
            .unwrap();
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let b = AgentId::new();
        assert!(mgr.lock_file("i.txt", "edit", b, None).await.is_ok());
    }
}
