//! Coordination Client façade.
//!
//! A scoped session bundling agent registration, a background heartbeat
//! loop, and handles to every other subsystem. Entering the scope
//! registers the agent and starts heartbeating; leaving it (all exit paths,
//! including panics — via `Drop`) stops the heartbeat, releases any locks
//! acquired through this session, and deregisters the agent — the same
//! scoping discipline applied to agent coordination sessions instead of
//! HTTP/Discord request sessions.

use crate::approval::ApprovalWorkflow;
use crate::audit::AuditLog;
use crate::board::{Board, ChannelManager, LogChannel};
use crate::error::CoordError;
use crate::ids::AgentId;
use crate::kv::{FileBackend, KvBackend, RedisBackend};
use crate::llm_budget::LlmBudget;
use crate::locks::FileLockManager;
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Everything a session needs to decide heartbeat cadence, hung detection,
/// and lock defaults without re-reading the environment on every call.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub heartbeat_interval_seconds: u64,
    pub hung_after_seconds: i64,
    pub lock_ttl_seconds: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: crate::constants::DEFAULT_HEARTBEAT_SECONDS,
            hung_after_seconds: crate::constants::DEFAULT_HUNG_SECONDS,
            lock_ttl_seconds: crate::constants::DEFAULT_LOCK_TTL_SECONDS,
        }
    }
}

/// Connects to the networked KV if `redis_url` is reachable, otherwise
/// transparently degrades to the file-backed fallback rooted at
/// `fallback_dir` — callers never choose a backend themselves.
pub async fn connect_kv(redis_url: Option<&str>, fallback_dir: &std::path::Path) -> Result<Arc<dyn KvBackend>> {
    if let Some(url) = redis_url {
        match RedisBackend::connect(url).await {
            Ok(backend) => {
                info!("connected to networked KV backend");
                return Ok(Arc::new(backend));
            }
            Err(e) => {
                warn!(error = %e, "networked KV unreachable, falling back to file backend");
            }
        }
    }
    let backend = FileBackend::open(fallback_dir.to_path_buf()).await?;
    Ok(Arc::new(backend))
}

/// A scoped "I am agent X doing Y" session: the canonical entry point
/// library users are expected to reach for.
pub struct CoordinationSession {
    pub agent_id: AgentId,
    pub kv: Arc<dyn KvBackend>,
    pub registry: AgentRegistry,
    pub queue: TaskQueue,
    pub locks: Arc<FileLockManager>,
    pub approvals: ApprovalWorkflow,
    pub board: Board,
    pub channels: ChannelManager,
    pub audit: AuditLog,
    pub llm_budget: Arc<LlmBudget>,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
    acquired_locks: Mutex<Vec<crate::ids::LockId>>,
}

impl CoordinationSession {
    /// Enters the scope: registers the agent and starts a background
    /// heartbeat task tied to this session's lifetime.
    pub async fn start(
        kv: Arc<dyn KvBackend>,
        role: impl Into<String>,
        name: impl Into<String>,
        working_on: impl Into<String>,
        capabilities: HashSet<String>,
        options: SessionOptions,
    ) -> Result<Self> {
        let registry = AgentRegistry::new(kv.clone(), options.hung_after_seconds);
        let agent_id = registry.register(role, name, working_on, capabilities).await?;
        let queue = TaskQueue::new(kv.clone(), registry.clone());
        let locks = Arc::new(FileLockManager::new(kv.clone(), options.lock_ttl_seconds));
        let approvals = ApprovalWorkflow::new(kv.clone());
        let board = Board::new(kv.clone());
        let mut channels = ChannelManager::new();
        channels.register(Arc::new(LogChannel));
        let audit = AuditLog::new(kv.clone());
        let llm_budget = Arc::new(LlmBudget::new(kv.clone(), 4, None));

        let heartbeat_handle = {
            let registry = registry.clone();
            let interval = std::time::Duration::from_secs(options.heartbeat_interval_seconds);
            tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        ticker.tick().await;
                        if let Err(e) = registry.heartbeat(agent_id, None).await {
                            warn!(agent_id = %agent_id, error = %e, "heartbeat failed, continuing");
                        }
                    }
            })
        };

        info!(agent_id = %agent_id, "coordination session started");
        Ok(Self {
                agent_id,
                kv,
                registry,
                queue,
                locks,
                approvals,
                board,
                channels,
                audit,
                llm_budget,
                heartbeat_handle: Mutex::new(Some(heartbeat_handle)),
                acquired_locks: Mutex::new(Vec::new()),
        })
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn kv(&self) -> &Arc<dyn KvBackend> {
        &self.kv
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn locks(&self) -> &Arc<FileLockManager> {
        &self.locks
    }

    pub fn approvals(&self) -> &ApprovalWorkflow {
        &self.approvals
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn llm_budget(&self) -> &Arc<LlmBudget> {
        &self.llm_budget
    }

    /// Acquire a lock through this session, tracked so [`CoordinationSession::end()`]
    /// can release anything still held on scope exit.
    pub async fn scoped_lock(&self, path: &str, intent: impl Into<String>) -> Result<crate::locks::ScopedLock> {
        let guard = FileLockManager::scoped_lock(&self.locks, path, intent, self.agent_id, None).await?;
        self.acquired_locks.lock().await.push(guard.lock_id);
        Ok(guard)
    }

    pub async fn heartbeat(&self, working_on: Option<String>) -> Result<()> {
        self.registry.heartbeat(self.agent_id, working_on).await
    }

    /// Leaves the scope: stops the heartbeat, releases every lock acquired
    /// through this session, and deregisters the agent. Idempotent — safe
    /// to call more than once (`Drop` calls the best-effort equivalent if
    /// this was never called explicitly).
    pub async fn end(&self) -> Result<()> {
        if let Some(handle) = self.heartbeat_handle.lock().await.take() {
            handle.abort();
        }
        let locks: Vec<_> = self.acquired_locks.lock().await.drain(..).collect();
        for lock_id in locks {
            if let Err(e) = self.locks.release_lock(lock_id).await {
                warn!(lock_id = %lock_id, error = %e, "failed to release session lock on scope exit");
            }
        }
        self.registry.deregister(self.agent_id).await?;
        info!(agent_id = %self.agent_id, "coordination session ended");
        Ok(())
    }
}

impl Drop for CoordinationSession {
    /// Best-effort cleanup mirroring [`crate::locks::ScopedLock`]'s pattern:
    /// if `end` was never called, a detached task still aborts the
    /// heartbeat and deregisters the agent so a forgotten scope doesn't
    /// leave a phantom "active" agent behind forever.
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let agent_id = self.agent_id;
        let locks = self.locks.clone();
        let heartbeat_handle = self.heartbeat_handle.try_lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = &heartbeat_handle {
            handle.abort();
        }
        let acquired = self
        .acquired_locks
        .try_lock()
        .map(|mut l| std::mem::take(&mut *l))
        .unwrap_or_default();
        tokio::spawn(async move {
                for lock_id in acquired {
                    let _ = locks.release_lock(lock_id).await;
                }
                if let Err(e) = registry.deregister(agent_id).await {
                    warn!(agent_id = %agent_id, error = %e, "best-effort session teardown failed");
                }
        });
    }
}

/// Raised when a session tries to operate against a backend that is
/// neither the networked KV nor a writable fallback directory (
/// "Failure semantics").
pub fn require_backend(kv: Option<Arc<dyn KvBackend>>) -> Result<Arc<dyn KvBackend>> {
    kv.ok_or_else(|| CoordError::backend_unavailable("no KV backend configured"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    async fn kv() -> Arc<dyn KvBackend> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(FileBackend::open(dir.into_path()).await.unwrap())
    }

    #[tokio::test]
    async fn start_registers_agent_and_end_deregisters() {
        let kv = kv().await;
        let session = CoordinationSession::start(
            kv.clone(),
            "developer",
            "alice",
            "onboarding",
            HashSet::new(),
            SessionOptions {
                heartbeat_interval_seconds: 3600,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let agent_id = session.agent_id();
        let agent = session.registry().get(agent_id).await.unwrap().unwrap();
        assert_eq!(agent.status, crate::models::AgentStatus::Active);

        session.end().await.unwrap();
        let agent = session.registry().get(agent_id).await.unwrap().unwrap();
        assert_eq!(agent.status, crate::models::AgentStatus::Terminated);
    }

    #[tokio::test]
    async fn scoped_lock_through_session_is_released_on_end() {
        let kv = kv().await;
        let session = Arc::new(
            CoordinationSession::start(
                kv.clone(),
                "developer",
                "bob",
                "editing",
                HashSet::new(),
                SessionOptions {
                    heartbeat_interval_seconds: 3600,
                    ..Default::default()
                },
            )
            .await
            .unwrap(),
        );
        let guard = session.scoped_lock("f.txt", "edit").await.unwrap();
        guard.release().await.unwrap();
        session.end().await.unwrap();
        assert!(session.locks().list_locks().await.unwrap().is_empty());
    }
}
