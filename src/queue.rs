//! Task Queue — the central component: priority ordering, atomic
//! claiming, dependency-gated readiness, lifecycle transitions, retry and
//! escalation, plus the two background sweepers.
//!
//! `TaskStatus::Claimed` covers both "claimed" and "in progress" (see
//! `DESIGN.md`'s open-question decisions): the state machine here is
//! `Pending -> Claimed -> {Completed, Failed} -> (retry) -> Escalated ->
//! (archive) -> Dlq`, with the claimed/in_progress distinction merged away.

use crate::audit::AuditLog;
use crate::constants::{ESCALATION_CHANNEL, MAX_RETRY_DELAY_SECONDS};
use crate::error::CoordError;
use crate::ids::{AgentId, TaskId};
use crate::kv::{keys, KvBackend};
use crate::models::{
    EscalationAction, EscalationEvent, EscalationEventPayload, RetryPolicy, Task, TaskStatus,
};
use crate::registry::AgentRegistry;
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Score a task sorts by in `tasks:pending`. Higher priority must come
/// first under ascending iteration (the primitive every backend gives us
/// cheaply via `zrange_by_score`/`zpopmin`), so priority is negated; within
/// a priority, earlier `created_at` sorts first for FIFO. This is a
/// deliberate reformulation of literal `priority*1e9 +
/// inverse_timestamp` formula, which (read literally, under ascending
/// iteration) would hand out the *lowest* priority first — see
/// `DESIGN.md`.
fn pending_score(priority: i64, created_at: DateTime<Utc>) -> f64 {
    -(priority as f64) * 1e9 + created_at.timestamp_millis() as f64
}

#[derive(Clone)]
pub struct TaskQueue {
    kv: Arc<dyn KvBackend>,
    audit: AuditLog,
    registry: AgentRegistry,
}

impl TaskQueue {
    pub fn new(kv: Arc<dyn KvBackend>, registry: AgentRegistry) -> Self {
        Self {
            audit: AuditLog::new(kv.clone()),
            kv,
            registry,
        }
    }

    async fn write(&self, task: &Task) -> Result<()> {
        let payload = serde_json::to_string(task)?;
        self.kv.set(&keys::task(task.id), &payload).await
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        match self.kv.get(&keys::task(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn require_task(&self, id: TaskId) -> Result<Task> {
        self.get_task(id)
        .await?
        .ok_or_else(|| CoordError::UnknownTask(id.to_string()))
    }

    /// Creates a new task. Tasks with no dependencies enter the pending
    /// sorted set immediately; otherwise they wait for their last
    /// dependency to complete.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_task(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
        priority: i64,
        tags: HashSet<String>,
        depends_on: HashSet<TaskId>,
        retry_policy: RetryPolicy,
        max_retries: u32,
        retry_delay_base_seconds: u64,
    ) -> Result<TaskId> {
        let mut task = Task::new(title, description);
        task.priority = priority;
        task.tags = tags;
        task.depends_on = depends_on.clone();
        task.retry_policy = retry_policy;
        task.max_retries = max_retries;
        task.retry_delay_base_seconds = retry_delay_base_seconds;
        let id = task.id;

        self.write(&task).await?;
        self.kv.sadd(keys::TASKS_ALL, &id.to_string()).await?;

        if depends_on.is_empty() {
            self.kv
            .zadd(keys::TASKS_PENDING, pending_score(priority, task.created_at), &id.to_string())
            .await?;
        } else {
            for dep in &depends_on {
                self.kv
                .sadd(&keys::tasks_dependents(*dep), &id.to_string())
                .await?;
            }
        }

        info!(task_id = %id, priority, "task created");
        Ok(id)
    }

    /// Whether every dependency of `task` is completed, re-checked against
    /// live records rather than trusted from sorted-set membership — a
    /// double-check against races between dependency completion and
    /// promotion.
    async fn dependencies_satisfied(&self, task: &Task) -> Result<bool> {
        for dep in &task.depends_on {
            match self.get_task(*dep).await? {
                Some(dep_task) if dep_task.status == TaskStatus::Completed => continue,
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Returns the head of the pending queue whose dependencies are
    /// satisfied. A read, never a claim.
    pub async fn get_ready_tasks(&self, limit: Option<usize>) -> Result<Vec<Task>> {
        let candidates = self
        .kv
        .zrange_by_score(keys::TASKS_PENDING, f64::MIN, f64::MAX, None)
        .await?;
        let mut out = Vec::new();
        for (member, _score) in candidates {
            let Ok(id) = member.parse::<TaskId>() else {
                continue;
            };
            let Some(task) = self.get_task(id).await? else {
                continue;
            };
            if task.status == TaskStatus::Pending && self.dependencies_satisfied(&task).await? {
                out.push(task);
                if let Some(limit) = limit {
                    if out.len() >= limit {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Atomically claims the highest-priority ready task matching `tags`,
    /// if any. A single attempt; see [`TaskQueue::claim_task_blocking`]
    /// for the suspending variant.
    ///
    /// Atomicity rests entirely on [`KvBackend::zrem`]'s semantics: it can
    /// report "removed" for a given member exactly once across however
    /// many processes call it concurrently, so whichever caller's `zrem`
    /// returns `true` is the sole claimant — no Lua script needed for this
    /// operation (see [`crate::kv`]'s module doc for the tradeoff this
    /// makes against server-side scripting).
    pub async fn claim_task(&self, agent_id: AgentId, tags: Option<&HashSet<String>>) -> Result<Option<Task>> {
        let candidates = self
        .kv
        .zrange_by_score(keys::TASKS_PENDING, f64::MIN, f64::MAX, None)
        .await?;

        for (member, _score) in candidates {
            let Ok(id) = member.parse::<TaskId>() else {
                continue;
            };
            let Some(mut task) = self.get_task(id).await? else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            if !self.dependencies_satisfied(&task).await? {
                continue;
            }
            if let Some(tags) = tags {
                if !task.matches_tags(tags) {
                    continue;
                }
            }

            if !self.kv.zrem(keys::TASKS_PENDING, &member).await? {
                // Lost the race for this one; someone else claimed it.
                continue;
            }

            task.status = TaskStatus::Claimed;
            task.claimed_by = Some(agent_id);
            task.claimed_at = Some(Utc::now());
            task.updated_at = Utc::now();
            self.write(&task).await?;
            self.kv
            .sadd(&keys::tasks_by_agent(agent_id), &id.to_string())
            .await?;

            self.audit
            .record(Some(agent_id), "task_claim", id.to_string(), task.title.clone())
            .await?;
            debug!(task_id = %id, agent_id = %agent_id, "task claimed");
            return Ok(Some(task));
        }

        Ok(None)
    }

    /// Suspends, polling with capped backoff, until a task is claimed or
    /// `timeout` elapses.
    pub async fn claim_task_blocking(
        &self,
        agent_id: AgentId,
        tags: Option<&HashSet<String>>,
        timeout: std::time::Duration,
    ) -> Result<Option<Task>> {
        use crate::constants::{CLAIM_POLL_MAX_MS, CLAIM_POLL_MIN_MS};

        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff_ms = CLAIM_POLL_MIN_MS;
        loop {
            if let Some(task) = self.claim_task(agent_id, tags).await? {
                return Ok(Some(task));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let sleep_for = std::time::Duration::from_millis(backoff_ms).min(remaining);
            tokio::time::sleep(sleep_for).await;
            backoff_ms = (backoff_ms * 2).min(CLAIM_POLL_MAX_MS);
        }
    }

    /// Promote every not-yet-pending dependent of `completed_id` whose
    /// dependencies are now all satisfied. Called from both
    /// `complete_task` and nowhere else — promotion only ever happens on
    /// completion.
    async fn promote_ready_dependents(&self, completed_id: TaskId) -> Result<()> {
        let dependents = self.kv.smembers(&keys::tasks_dependents(completed_id)).await?;
        for member in dependents {
            let Ok(id) = member.parse::<TaskId>() else {
                continue;
            };
            let Some(task) = self.get_task(id).await? else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            if self.dependencies_satisfied(&task).await? {
                self.kv
                .zadd(keys::TASKS_PENDING, pending_score(task.priority, task.created_at), &id.to_string())
                .await?;
            }
        }
        Ok(())
    }

    /// Marks a claimed task completed and promotes any dependents that
    /// became ready as a result.
    pub async fn complete_task(&self, task_id: TaskId, result: Option<String>) -> Result<()> {
        let mut task = self.require_task(task_id).await?;
        if task.status != TaskStatus::Claimed {
            return Err(CoordError::illegal_transition(format!(
                        "cannot complete task {task_id} in status {:?}",
                        task.status
            )));
        }
        let agent_id = task.claimed_by;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.updated_at = Utc::now();
        task.result = result;
        self.write(&task).await?;

        if let Some(agent_id) = agent_id {
            self.kv
            .srem(&keys::tasks_by_agent(agent_id), &task_id.to_string())
            .await?;
        }

        self.promote_ready_dependents(task_id).await?;

        self.audit
        .record(agent_id, "task_complete", task_id.to_string(), task.title.clone())
        .await?;
        info!(task_id = %task_id, "task completed");
        Ok(())
    }

    fn compute_retry_delay(&self, policy: RetryPolicy, base: u64, retry_count: u32) -> u64 {
        let delay = match policy {
            RetryPolicy::None => 0,
            RetryPolicy::Linear => base,
            RetryPolicy::Exponential => {
                base.saturating_mul(1u64.checked_shl(retry_count.saturating_sub(1)).unwrap_or(u64::MAX))
            }
        };
        delay.min(MAX_RETRY_DELAY_SECONDS)
    }

    /// Marks a claimed task failed, scheduling a retry or escalating once
    /// the retry budget is exhausted.
    pub async fn fail_task(&self, task_id: TaskId, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        let mut task = self.require_task(task_id).await?;
        if task.status != TaskStatus::Claimed {
            return Err(CoordError::illegal_transition(format!(
                        "cannot fail task {task_id} in status {:?}",
                        task.status
            )));
        }
        let agent_id = task.claimed_by;
        task.error = Some(error.clone());
        task.retry_count += 1;
        task.status = TaskStatus::Failed;
        task.updated_at = Utc::now();

        if let Some(agent_id) = agent_id {
            self.kv
            .srem(&keys::tasks_by_agent(agent_id), &task_id.to_string())
            .await?;
        }

        let exhausted = task.retry_policy == RetryPolicy::None || task.retry_count > task.max_retries;

        if exhausted {
            task.status = TaskStatus::Escalated;
            task.escalated_at = Some(Utc::now());
            task.escalation_reason = Some(error.clone());
            task.escalation_history.push(EscalationEvent {
                    timestamp: Utc::now(),
                    retry_count: task.retry_count,
                    reason: error.clone(),
                    action: EscalationAction::Escalated,
            });
            self.write(&task).await?;
            self.kv
            .zadd(keys::TASKS_ESCALATED, Utc::now().timestamp as f64, &task_id.to_string())
            .await?;
            self.publish_escalation(&task, &error).await?;
            self.audit
            .record(agent_id, "task_escalated", task_id.to_string(), error.clone())
            .await?;
            warn!(task_id = %task_id, retries = task.retry_count, "task escalated after retries exhausted");
        } else {
            task.escalation_history.push(EscalationEvent {
                    timestamp: Utc::now(),
                    retry_count: task.retry_count,
                    reason: error.clone(),
                    action: EscalationAction::Retried,
            });
            self.write(&task).await?;

            let delay = self.compute_retry_delay(task.retry_policy, task.retry_delay_base_seconds, task.retry_count);
            let mut child = Task::new(task.title.clone(), task.description.clone());
            child.priority = task.priority;
            child.tags = task.tags.clone();
            child.depends_on = task.depends_on.clone();
            child.retry_policy = task.retry_policy;
            child.max_retries = task.max_retries;
            child.retry_delay_base_seconds = task.retry_delay_base_seconds;
            child.retry_count = task.retry_count;
            child.parent_task_id = Some(task_id);
            child.metadata = task.metadata.clone();
            let child_id = child.id;

            self.write(&child).await?;
            self.kv.sadd(keys::TASKS_ALL, &child_id.to_string()).await?;
            for dep in &child.depends_on {
                self.kv
                .sadd(&keys::tasks_dependents(*dep), &child_id.to_string())
                .await?;
            }

            let scheduled_at = (Utc::now() + Duration::seconds(delay as i64)).timestamp as f64;
            self.kv
            .zadd(keys::TASKS_RETRY, scheduled_at, &child_id.to_string())
            .await?;

            self.audit
            .record(agent_id, "task_failed", task_id.to_string(), format!("retry scheduled in {delay}s as {child_id}"))
            .await?;
            info!(task_id = %task_id, child_id = %child_id, delay, "task failed, retry scheduled");
        }

        Ok(())
    }

    async fn publish_escalation(&self, task: &Task, reason: &str) -> Result<()> {
        let payload = EscalationEventPayload {
            event_type: "task_escalated",
            task_id: task.id,
            task_title: task.title.clone(),
            reason: reason.to_string(),
            retry_count: task.retry_count,
            timestamp: Utc::now(),
            claimed_by: task.claimed_by,
        };
        let json = serde_json::to_string(&payload)?;
        self.kv.publish(ESCALATION_CHANNEL, &json).await
    }

    /// Manually escalates a task outside the automatic retry path.
    pub async fn escalate_task(&self, task_id: TaskId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let mut task = self.require_task(task_id).await?;
        match task.status {
            TaskStatus::Pending | TaskStatus::Claimed | TaskStatus::Failed => {}
            other => {
                return Err(CoordError::illegal_transition(format!(
                            "cannot escalate task {task_id} in status {other:?}"
                )))
            }
        }

        if task.status == TaskStatus::Pending {
            self.kv.zrem(keys::TASKS_PENDING, &task_id.to_string()).await?;
        }
        if let Some(agent_id) = task.claimed_by {
            self.kv
            .srem(&keys::tasks_by_agent(agent_id), &task_id.to_string())
            .await?;
        }

        task.status = TaskStatus::Escalated;
        task.escalated_at = Some(Utc::now());
        task.escalation_reason = Some(reason.clone());
        task.escalation_history.push(EscalationEvent {
                timestamp: Utc::now(),
                retry_count: task.retry_count,
                reason: reason.clone(),
                action: EscalationAction::ManuallyEscalated,
        });
        let claimed_by = task.claimed_by;
        self.write(&task).await?;
        self.kv
        .zadd(keys::TASKS_ESCALATED, Utc::now().timestamp as f64, &task_id.to_string())
        .await?;
        self.publish_escalation(&task, &reason).await?;
        self.audit
        .record(claimed_by, "task_escalated", task_id.to_string(), reason)
        .await?;
        Ok(())
    }

    /// operation 7, retry half. Re-enqueues a fresh record linked by
    /// `parent_task_id`; the escalated record itself is left untouched.
    pub async fn retry_task(&self, task_id: TaskId) -> Result<TaskId> {
        let mut task = self.require_task(task_id).await?;
        if task.status != TaskStatus::Escalated {
            return Err(CoordError::illegal_transition(format!(
                        "cannot retry task {task_id} in status {:?}",
                        task.status
            )));
        }

        let mut child = Task::new(task.title.clone(), task.description.clone());
        child.priority = task.priority;
        child.tags = task.tags.clone();
        child.depends_on = task.depends_on.clone();
        child.retry_policy = task.retry_policy;
        child.max_retries = task.max_retries;
        child.retry_delay_base_seconds = task.retry_delay_base_seconds;
        child.parent_task_id = Some(task_id);
        child.metadata = task.metadata.clone();
        let child_id = child.id;

        self.write(&child).await?;
        self.kv.sadd(keys::TASKS_ALL, &child_id.to_string()).await?;
        if child.depends_on.is_empty() {
            self.kv
            .zadd(keys::TASKS_PENDING, pending_score(child.priority, child.created_at), &child_id.to_string())
            .await?;
        } else {
            for dep in &child.depends_on {
                self.kv
                .sadd(&keys::tasks_dependents(*dep), &child_id.to_string())
                .await?;
            }
        }

        task.escalation_history.push(EscalationEvent {
                timestamp: Utc::now(),
                retry_count: task.retry_count,
                reason: format!("requeued as {child_id}"),
                action: EscalationAction::Requeued,
        });
        self.write(&task).await?;

        self.audit
        .record(None, "task_retry", task_id.to_string(), child_id.to_string())
        .await?;
        Ok(child_id)
    }

    /// operation 7, archive half.
    pub async fn archive_task(&self, task_id: TaskId) -> Result<()> {
        let mut task = self.require_task(task_id).await?;
        if task.status != TaskStatus::Escalated {
            return Err(CoordError::illegal_transition(format!(
                        "cannot archive task {task_id} in status {:?}",
                        task.status
            )));
        }
        self.kv.zrem(keys::TASKS_ESCALATED, &task_id.to_string()).await?;
        self.kv
        .zadd(keys::TASKS_DLQ, Utc::now().timestamp as f64, &task_id.to_string())
        .await?;
        task.escalation_history.push(EscalationEvent {
                timestamp: Utc::now(),
                retry_count: task.retry_count,
                reason: "archived to dead-letter queue".to_string(),
                action: EscalationAction::Archived,
        });
        self.write(&task).await?;
        self.audit
        .record(None, "task_archived", task_id.to_string(), String::new())
        .await?;
        Ok(())
    }

    /// Returns the full dependency graph for inspection by higher layers.
    pub async fn get_dependency_graph(&self) -> Result<HashMap<TaskId, DependencyNode>> {
        let all_ids = self.kv.smembers(keys::TASKS_ALL).await?;
        let mut graph = HashMap::with_capacity(all_ids.len());
        for raw_id in &all_ids {
            let Ok(id) = raw_id.parse::<TaskId>() else {
                continue;
            };
            if let Some(task) = self.get_task(id).await? {
                graph.insert(
                    id,
                    DependencyNode {
                        status: task.status,
                        depends_on: task.depends_on.clone(),
                        dependents: HashSet::new(),
                    },
                );
            }
        }
        let ids: Vec<TaskId> = graph.keys().copied().collect();
        for id in ids {
            let depends_on = graph.get(&id).map(|n| n.depends_on.clone()).unwrap_or_default();
            for dep in depends_on {
                if let Some(dep_node) = graph.get_mut(&dep) {
                    dep_node.dependents.insert(id);
                }
            }
        }
        Ok(graph)
    }

    /// listing surface: tasks filtered by status/tag/priority.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        tag: Option<&str>,
        min_priority: Option<i64>,
    ) -> Result<Vec<Task>> {
        let all_ids = self.kv.smembers(keys::TASKS_ALL).await?;
        let mut out = Vec::new();
        for raw_id in all_ids {
            let Ok(id) = raw_id.parse::<TaskId>() else {
                continue;
            };
            let Some(task) = self.get_task(id).await? else {
                continue;
            };
            if let Some(status) = status {
                if task.status != status {
                    continue;
                }
            }
            if let Some(tag) = tag {
                if !task.tags.contains(tag) {
                    continue;
                }
            }
            if let Some(min_priority) = min_priority {
                if task.priority < min_priority {
                    continue;
                }
            }
            out.push(task);
        }
        out.sort_by_key(|t| (std::cmp::Reverse(t.priority), t.created_at));
        Ok(out)
    }

    /// Background retry sweeper: every call moves due entries
    /// from `tasks:retry` into `tasks:pending`. Intended to be driven by a
    /// `tokio::spawn`ed loop (see [`crate::session`]), but exposed as a
    /// single tick so tests can drive it deterministically without
    /// waiting on real wall-clock time.
    pub async fn sweep_due_retries(&self) -> Result<usize> {
        let now = Utc::now().timestamp as f64;
        let due = self
        .kv
        .zrange_by_score(keys::TASKS_RETRY, f64::MIN, now, None)
        .await?;
        let mut moved = 0;
        for (member, _score) in due {
            if !self.kv.zrem(keys::TASKS_RETRY, &member).await? {
                continue;
            }
            let Ok(id) = member.parse::<TaskId>() else {
                continue;
            };
            let Some(task) = self.get_task(id).await? else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            if self.dependencies_satisfied(&task).await? {
                self.kv
                .zadd(keys::TASKS_PENDING, pending_score(task.priority, task.created_at), &member)
                .await?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Background reclamation sweeper: returns
    /// every task leased by a hung agent back to `pending`, clearing
    /// `claimed_by` and re-validating dependencies.
    pub async fn sweep_reclaim_hung(&self) -> Result<usize> {
        let agents = self.registry.list_agents().await?;
        let mut reclaimed = 0;
        for agent in agents {
            if agent.status != crate::models::AgentStatus::Hung {
                continue;
            }
            let leased = self.kv.smembers(&keys::tasks_by_agent(agent.id)).await?;
            for raw_id in leased {
                let Ok(id) = raw_id.parse::<TaskId>() else {
                    continue;
                };
                let Some(mut task) = self.get_task(id).await? else {
                    continue;
                };
                if task.status != TaskStatus::Claimed {
                    continue;
                }
                self.kv.srem(&keys::tasks_by_agent(agent.id), &raw_id).await?;
                task.status = TaskStatus::Pending;
                task.claimed_by = None;
                task.claimed_at = None;
                task.updated_at = Utc::now();
                self.write(&task).await?;
                if self.dependencies_satisfied(&task).await? {
                    self.kv
                    .zadd(keys::TASKS_PENDING, pending_score(task.priority, task.created_at), &raw_id)
                    .await?;
                }
                self.audit
                .record(Some(agent.id), "task_reclaimed", id.to_string(), "agent hung".to_string())
                .await?;
                reclaimed += 1;
                warn!(task_id = %id, agent_id = %agent.id, "task reclaimed from hung agent");
            }
        }
        Ok(reclaimed)
    }
}

/// One node of the dependency graph returned by `get_dependency_graph`.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub status: TaskStatus,
    pub depends_on: HashSet<TaskId>,
    pub dependents: HashSet<TaskId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::FileBackend;
    use std::collections::HashSet;

    async fn queue() -> TaskQueue {
        let dir = tempfile::tempdir().unwrap();
        let kv: Arc<dyn KvBackend> = Arc::new(FileBackend::open(dir.into_path()).await.unwrap());
        let registry = AgentRegistry::new(kv.clone(), 300);
        TaskQueue::new(kv, registry)
    }

    async fn create(q: &TaskQueue, title: &str, priority: i64, deps: HashSet<TaskId>) -> TaskId {
        q.create_task(
            title,
            "desc",
            priority,
            HashSet::new(),
            deps,
            RetryPolicy::Exponential,
            3,
            60,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn dependency_chain_is_claimed_in_order() {
        let q = queue().await;
        let agent = AgentId::new();
        let t1 = create(&q, "t1", 5, HashSet::new()).await;
        let t2 = create(&q, "t2", 5, HashSet::from([t1])).await;
        let t3 = create(&q, "t3", 10, HashSet::from([t2])).await;

        let claimed1 = q.claim_task(agent, None).await.unwrap().unwrap();
        assert_eq!(claimed1.id, t1);
        // t2's dependency isn't done yet; nothing else is ready.
        assert!(q.claim_task(agent, None).await.unwrap().is_none());

        q.complete_task(t1, None).await.unwrap();
        let claimed2 = q.claim_task(agent, None).await.unwrap().unwrap();
        assert_eq!(claimed2.id, t2);

        q.complete_task(t2, None).await.unwrap();
        let claimed3 = q.claim_task(agent, None).await.unwrap().unwrap();
        assert_eq!(claimed3.id, t3);
    }

    #[tokio::test]
    async fn priority_then_fifo_ordering() {
        let q = queue().await;
        let agent = AgentId::new();
        let low = create(&q, "low", 1, HashSet::new()).await;
        let high = create(&q, "high", 10, HashSet::new()).await;

        let first = q.claim_task(agent, None).await.unwrap().unwrap();
        assert_eq!(first.id, high);
        let second = q.claim_task(agent, None).await.unwrap().unwrap();
        assert_eq!(second.id, low);
    }

    #[tokio::test]
    async fn tag_routing_prevents_cross_assignment() {
        let q = queue().await;
        let backend_agent = AgentId::new();
        let frontend_agent = AgentId::new();

        let mut backend_task = Task::new("backend work", "desc");
        backend_task.tags = HashSet::from(["backend".to_string()]);
        let backend_id = backend_task.id;
        q.write(&backend_task).await.unwrap();
        q.kv.sadd(keys::TASKS_ALL, &backend_id.to_string()).await.unwrap();
        q.kv
        .zadd(keys::TASKS_PENDING, pending_score(0, backend_task.created_at), &backend_id.to_string())
        .await
        .unwrap();

        let mut frontend_task = Task::new("frontend work", "desc");
        frontend_task.tags = HashSet::from(["frontend".to_string()]);
        let frontend_id = frontend_task.id;
        q.write(&frontend_task).await.unwrap();
        q.kv.sadd(keys::TASKS_ALL, &frontend_id.to_string()).await.unwrap();
        q.kv
        .zadd(keys::TASKS_PENDING, pending_score(0, frontend_task.created_at), &frontend_id.to_string())
        .await
        .unwrap();

        let backend_tags = HashSet::from(["backend".to_string()]);
        let frontend_tags = HashSet::from(["frontend".to_string()]);

        let claimed = q.claim_task(backend_agent, Some(&backend_tags)).await.unwrap().unwrap();
        assert_eq!(claimed.id, backend_id);
        let claimed = q.claim_task(frontend_agent, Some(&frontend_tags)).await.unwrap().unwrap();
        assert_eq!(claimed.id, frontend_id);
    }

    #[tokio::test]
    async fn retry_then_escalate_after_max_retries() {
        let q = queue().await;
        let agent = AgentId::new();
        let t = q
        .create_task("flaky", "desc", 0, HashSet::new(), HashSet::new(), RetryPolicy::Exponential, 2, 1)
        .await
        .unwrap();

        for attempt in 1..=2 {
            let claimed = q.claim_task(agent, None).await.unwrap().unwrap();
            q.fail_task(claimed.id, format!("e{attempt}")).await.unwrap();
            // exponential delay for this retry is base * 2^(attempt-1) seconds
            let delay_ms = 1000u64 * (1u64 << (attempt - 1));
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms + 100)).await;
            let moved = q.sweep_due_retries().await.unwrap();
            assert_eq!(moved, 1);
        }

        let claimed = q.claim_task(agent, None).await.unwrap().unwrap();
        q.fail_task(claimed.id, "e3").await.unwrap();

        let final_task = q.get_task(claimed.id).await.unwrap().unwrap();
        assert_eq!(final_task.status, TaskStatus::Escalated);
        assert_eq!(final_task.retry_count, 3);
        let _ = t;
    }

    #[tokio::test]
    async fn reclaim_after_hang_returns_task_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        let kv: Arc<dyn KvBackend> = Arc::new(FileBackend::open(dir.into_path()).await.unwrap());
        let registry = AgentRegistry::new(kv.clone(), 0); // hung immediately
        let q = TaskQueue::new(kv, registry.clone());

        let agent_a = registry.register("dev", "a", "", HashSet::new()).await.unwrap();
        let t = create(&q, "t", 0, HashSet::new()).await;
        let claimed = q.claim_task(agent_a, None).await.unwrap().unwrap();
        assert_eq!(claimed.id, t);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let reclaimed = q.sweep_reclaim_hung().await.unwrap();
        assert_eq!(reclaimed, 1);

        let agent_b = registry.register("dev", "b", "", HashSet::new()).await.unwrap();
        let claimed = q.claim_task(agent_b, None).await.unwrap().unwrap();
        assert_eq!(claimed.id, t);
        assert_eq!(claimed.claimed_by, Some(agent_b));
    }
}
