//! Worker Spawner.
//!
//! Starts and supervises worker processes. The local-subprocess mode is
//! fully implemented on [`tokio::process::Command`]; container and cloud
//! modes are modeled behind [`ContainerRuntime`] as an extension point —
//! no real Docker/cloud client is wired in, so integration backends stay
//! behind a narrow trait until one is actually needed.

use crate::error::CoordError;
use crate::ids::AgentId;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    LocalProcess,
    Container,
    Cloud,
}

/// A process-like thing the spawner is responsible for. Implemented
/// directly for local subprocesses; container/cloud backends implement it
/// via [`ContainerRuntime`]-returned handles.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    fn agent_id(&self) -> AgentId;
    fn mode(&self) -> SpawnMode;
    fn started_at(&self) -> DateTime<Utc>;
    /// OS process id, for local-subprocess workers.
    fn pid(&self) -> Option<u32> {
        None
    }
    /// Container id, for container/cloud-backed workers.
    fn container_id(&self) -> Option<&str> {
        None
    }
    async fn is_alive(&mut self) -> bool;
    /// Ask the worker to stop, waiting up to `grace_seconds` before
    /// forcefully killing it.
    async fn terminate(&mut self, grace_seconds: u64) -> Result<()>;
}

struct LocalWorker {
    agent_id: AgentId,
    child: Child,
    started_at: DateTime<Utc>,
}

#[async_trait]
impl WorkerHandle for LocalWorker {
    fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    fn mode(&self) -> SpawnMode {
        SpawnMode::LocalProcess
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self, grace_seconds: u64) -> Result<()> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SIGTERM first; a process that ignores it gets SIGKILL
                // after the grace period via `child.kill` below.
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }
        let wait = tokio::time::timeout(
            std::time::Duration::from_secs(grace_seconds),
            self.child.wait(),
        )
        .await;
        if wait.is_err() {
            warn!(agent_id = %self.agent_id(), "worker did not exit within grace period, killing");
            self.child.kill().await.map_err(CoordError::Io)?;
        }
        Ok(())
    }
}

/// Extension point for non-local spawn modes. No implementation ships in
/// this crate; a deployment that needs container or cloud-backed workers
/// provides one.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn spawn(&self, agent_id: AgentId, image: &str, env: &HashMap<String, String>) -> Result<Box<dyn WorkerHandle>>;
}

#[derive(Clone, Default)]
pub struct WorkerSpawner {
    workers: Arc<Mutex<Vec<Box<dyn WorkerHandle>>>>,
    container_runtime: Option<Arc<dyn ContainerRuntime>>,
}

impl WorkerSpawner {
    pub fn new() -> Self {
        Self {
            workers: Arc::new(Mutex::new(Vec::new())),
            container_runtime: None,
        }
    }

    pub fn with_container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.container_runtime = Some(runtime);
        self
    }

    /// operation 1, local-subprocess path: launches `program` with
    /// `args`/`env`, tracking the child under `agent_id`. `tags` and
    /// `max_tasks` are passed through as env vars so the worker binary can
    /// self-configure which tags to claim with and when to self-terminate;
    /// they overwrite any caller-supplied values under the same keys.
    pub async fn spawn_worker(
        &self,
        agent_id: AgentId,
        program: &str,
        args: &[String],
        tags: &HashSet<String>,
        max_tasks: Option<u32>,
        env: &HashMap<String, String>,
    ) -> Result<()> {
        let mut command = Command::new(program);
        command
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
        if !tags.is_empty() {
            let mut sorted: Vec<&str> = tags.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            command.env("AGENTCOORD_WORKER_TAGS", sorted.join(","));
        }
        if let Some(max_tasks) = max_tasks {
            command.env("AGENTCOORD_WORKER_MAX_TASKS", max_tasks.to_string());
        }
        let child = command.spawn().map_err(CoordError::Io)?;
        let handle = LocalWorker {
            agent_id,
            child,
            started_at: Utc::now(),
        };
        self.workers.lock().await.push(Box::new(handle));
        info!(agent_id = %agent_id, program, "worker spawned");
        Ok(())
    }

    /// operation 1, container/cloud path.
    pub async fn spawn_container_worker(&self, agent_id: AgentId, image: &str, env: &HashMap<String, String>) -> Result<()> {
        let runtime = self
        .container_runtime
        .as_ref()
        .ok_or_else(|| CoordError::Configuration("no container runtime configured".to_string()))?;
        let handle = runtime.spawn(agent_id, image, env).await?;
        self.workers.lock().await.push(handle);
        Ok(())
    }

    /// Gracefully terminates a worker, returning whether one was found.
    pub async fn terminate_worker(&self, agent_id: AgentId, grace_seconds: u64) -> Result<bool> {
        let mut workers = self.workers.lock().await;
        if let Some(pos) = workers.iter().position(|w| w.agent_id() == agent_id) {
            let mut handle = workers.remove(pos);
            handle.terminate(grace_seconds).await?;
            info!(agent_id = %agent_id, "worker terminated");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// operation 3 / listing surface.
    pub async fn list_workers(&self) -> Vec<(AgentId, SpawnMode, DateTime<Utc>)> {
        let workers = self.workers.lock().await;
        workers
        .iter()
        .map(|w| (w.agent_id(), w.mode(), w.started_at()))
        .collect()
    }

    /// operation 4: reaps any worker whose process has already
    /// exited, returning the agent ids removed so the caller (normally the
    /// auto-scaler or the reclamation sweeper) can fold their leased tasks
    /// back into the pending queue.
    pub async fn gc_dead_workers(&self) -> Vec<AgentId> {
        let mut workers = self.workers.lock().await;
        let mut dead = Vec::new();
        let mut alive = Vec::new();
        for mut handle in workers.drain(..) {
            if handle.is_alive().await {
                alive.push(handle);
            } else {
                dead.push(handle.agent_id());
            }
        }
        *workers = alive;
        if !dead.is_empty() {
            warn!(count = dead.len(), "reaped dead workers");
        }
        dead
    }
}
