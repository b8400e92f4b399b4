//! Auto-Scaler.
//!
//! Runs inside a coordinator process: every `interval_seconds` it compares
//! queue depth against live worker count and spawns or terminates workers to
//! converge on `clamp(ceil(P / tasks_per_worker), min_workers, max_workers)`.
//! It never terminates a worker that currently holds a lease.

use crate::config::AutoScalerConfig;
use crate::ids::AgentId;
use crate::kv::{keys, KvBackend};
use crate::queue::TaskQueue;
use crate::spawner::WorkerSpawner;
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// One live worker this scaler is tracking, for the idle-grace bookkeeping
/// the scale-down step needs (the oldest idle worker must exceed an idle
/// grace before it's terminated).
#[derive(Debug, Clone, Copy)]
struct TrackedWorker {
    started_at: DateTime<Utc>,
}

pub struct AutoScaler {
    kv: Arc<dyn KvBackend>,
    queue: TaskQueue,
    spawner: Arc<WorkerSpawner>,
    config: AutoScalerConfig,
    program: String,
    args: Vec<String>,
    tags: std::collections::HashSet<String>,
    tracked: std::sync::Mutex<HashMap<AgentId, TrackedWorker>>,
}

impl AutoScaler {
    pub fn new(
        kv: Arc<dyn KvBackend>,
        queue: TaskQueue,
        spawner: Arc<WorkerSpawner>,
        config: AutoScalerConfig,
        program: impl Into<String>,
        args: Vec<String>,
        tags: std::collections::HashSet<String>,
    ) -> Self {
        Self {
            kv,
            queue,
            spawner,
            config,
            program: program.into(),
            args,
            tags,
            tracked: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Count of ready-or-claimed tasks — the pressure signal `P` the
    /// desired-worker-count formula scales against.
    async fn pressure(&self) -> Result<usize> {
        let ready = self.queue.get_ready_tasks(None).await?.len();
        let claimed = self
        .queue
        .list_tasks(Some(crate::models::TaskStatus::Claimed), None, None)
        .await?
        .len();
        Ok(ready + claimed)
    }

    fn desired(&self, pressure: usize) -> usize {
        let raw = pressure.div_ceil(self.config.tasks_per_worker.max(1));
        raw.clamp(self.config.min_workers, self.config.max_workers)
    }

    /// Agents (by id) currently holding at least one leased task; a worker
    /// backing one of these must never be terminated by step 4.
    async fn agents_with_leases(&self) -> Result<std::collections::HashSet<AgentId>> {
        let mut leased = std::collections::HashSet::new();
        for (agent_id, _, _) in self.spawner.list_workers().await {
            let key = keys::tasks_by_agent(agent_id);
            if !self.kv.smembers(&key).await?.is_empty() {
                leased.insert(agent_id);
            }
        }
        Ok(leased)
    }

    /// four-step loop, run once. Intended to be driven by a
    /// `tokio::spawn`ed `tick`-on-interval loop (see
    /// [`crate::session::CoordinationSession`]); exposed standalone so tests
    /// can drive it deterministically.
    pub async fn tick(&self) -> Result<()> {
        self.spawner.gc_dead_workers().await;
        {
            let mut tracked = self.tracked.lock().unwrap();
            let alive: std::collections::HashSet<AgentId> = futures_alive(self.spawner.clone())
            .await
            .into_iter()
            .collect();
            tracked.retain(|id, _| alive.contains(id));
        }

        let pressure = self.pressure().await?;
        let live = self.spawner.list_workers().await.len();
        let desired = self.desired(pressure);

        if desired > live {
            let to_spawn = desired - live;
            for _ in 0..to_spawn {
                let agent_id = AgentId::new();
                self.spawner
                .spawn_worker(
                    agent_id,
                    &self.program,
                    &self.args,
                    &self.tags,
                    self.config.worker_max_tasks,
                    &HashMap::new(),
                )
                .await?;
                self.tracked.lock().unwrap().insert(
                    agent_id,
                    TrackedWorker {
                        started_at: Utc::now(),
                    },
                );
            }
            info!(pressure, desired, live, spawned = to_spawn, "autoscaler scaled up");
        } else if desired < live && pressure == 0 {
            let leased = self.agents_with_leases().await?;
            let idle_grace = chrono::Duration::seconds(self.config.idle_grace_seconds);
            let now = Utc::now();
            let oldest_idle = {
                let tracked = self.tracked.lock().unwrap();
                tracked
                .iter()
                .filter(|(id, _)| !leased.contains(id))
                .filter(|(_, w)| now - w.started_at > idle_grace)
                .min_by_key(|(_, w)| w.started_at)
                .map(|(id, _)| *id)
            };
            if let Some(agent_id) = oldest_idle {
                self.spawner
                .terminate_worker(agent_id, self.config.interval_seconds.min(10))
                .await?;
                self.tracked.lock().unwrap().remove(&agent_id);
                info!(agent_id = %agent_id, "autoscaler scaled down idle worker");
            }
        }

        Ok(())
    }

    /// Runs [`AutoScaler::tick()`] forever on `config.interval_seconds`,
    /// logging and continuing on a transient tick failure rather than
    /// aborting the whole loop over one bad iteration.
    pub async fn run_forever(self: Arc<Self>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(self.config.interval_seconds));
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                tracing::warn!(error = %e, "autoscaler tick failed, continuing");
            }
        }
    }
}

/// Small helper kept free of the `Mutex` guard above to avoid holding it
/// across an `.await`.
async fn futures_alive(spawner: Arc<WorkerSpawner>) -> Vec<AgentId> {
    spawner.list_workers().await.into_iter().map(|(id, _, _)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::FileBackend;
    use crate::registry::AgentRegistry;

    async fn harness(min: usize, max: usize, per_worker: usize) -> AutoScaler {
        let dir = tempfile::tempdir().unwrap();
        let kv: Arc<dyn KvBackend> = Arc::new(FileBackend::open(dir.into_path()).await.unwrap());
        let registry = AgentRegistry::new(kv.clone(), 300);
        let queue = TaskQueue::new(kv.clone(), registry);
        let spawner = Arc::new(WorkerSpawner::new());
        let config = AutoScalerConfig {
            min_workers: min,
            max_workers: max,
            tasks_per_worker: per_worker,
            interval_seconds: 1,
            idle_grace_seconds: 0,
            worker_max_tasks: None,
        };
        AutoScaler::new(kv, queue, spawner, config, "true", vec![], Default::default())
    }

    #[tokio::test]
    async fn scales_up_to_min_workers_with_no_pressure() {
        let scaler = harness(2, 5, 4).await;
        scaler.tick().await.unwrap();
        assert_eq!(scaler.spawner.list_workers().await.len(), 2);
    }

    #[tokio::test]
    async fn scales_up_with_pending_tasks() {
        let scaler = harness(0, 10, 1).await;
        for i in 0..3 {
            scaler
            .queue
            .create_task(
                format!("t{i}"),
                "desc",
                0,
                Default::default(),
                Default::default(),
                crate::models::RetryPolicy::None,
                3,
                60,
            )
            .await
            .unwrap();
        }
        scaler.tick().await.unwrap();
        assert_eq!(scaler.spawner.list_workers().await.len(), 3);
    }

    #[tokio::test]
    async fn never_exceeds_max_workers() {
        let scaler = harness(0, 2, 1).await;
        for i in 0..10 {
            scaler
            .queue
            .create_task(
                format!("t{i}"),
                "desc",
                0,
                Default::default(),
                Default::default(),
                crate::models::RetryPolicy::None,
                3,
                60,
            )
            .await
            .unwrap();
        }
        scaler.tick().await.unwrap();
        assert_eq!(scaler.spawner.list_workers().await.len(), 2);
    }
}
