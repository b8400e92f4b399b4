//! Core data records shared by every subsystem.
//!
//! Every record here is a plain, tagged struct or enum serialized explicitly
//! at the KV boundary (see [`crate::kv`]) — none of it relies on reflection
//! or duck typing. Higher-level systems (workflows, roles, epics) are kept
//! out of these types entirely; they attach their own data through the
//! opaque `metadata` map on [`Task`] instead of this crate taking a
//! back-reference to them.

use crate::ids::{AgentId, ApprovalId, LockId, TaskId, ThreadId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Lifecycle status of a [`Task`].
///
/// Transitions are restricted to the graph documented on [`crate::queue`];
/// `Claimed` covers both the "claimed but not yet started" and "in
/// progress" phases, a deliberate merge — see `DESIGN.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Escalated,
}

/// Retry backoff policy applied by [`crate::queue::TaskQueue::fail_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    None,
    Linear,
    Exponential,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential
    }
}

/// One entry in a task's escalation history, appended on every failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub reason: String,
    pub action: EscalationAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    Retried,
    Escalated,
    ManuallyEscalated,
    Archived,
    Requeued,
}

/// The fundamental unit of work in the coordination core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub priority: i64,
    pub tags: HashSet<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_by: Option<AgentId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub depends_on: HashSet<TaskId>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_policy: RetryPolicy,
    pub retry_delay_base_seconds: u64,
    pub escalated_at: Option<DateTime<Utc>>,
    pub escalation_reason: Option<String>,
    pub escalation_history: Vec<EscalationEvent>,
    pub parent_task_id: Option<TaskId>,
    /// Opaque to the core; higher layers (roles/workflows/epics) stash
    /// whatever routing data they need here instead of this crate taking
    /// a back-reference to their object graph.
    pub metadata: HashMap<String, String>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            title: title.into(),
            description: description.into(),
            priority: 0,
            tags: HashSet::new(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            claimed_by: None,
            claimed_at: None,
            completed_at: None,
            depends_on: HashSet::new(),
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 3,
            retry_policy: RetryPolicy::default(),
            retry_delay_base_seconds: 60,
            escalated_at: None,
            escalation_reason: None,
            escalation_history: Vec::new(),
            parent_task_id: None,
            metadata: HashMap::new(),
        }
    }

    /// A task is ready iff it is pending and every dependency is complete.
    /// This re-checks dependency completion rather than trusting sorted-set
    /// membership, matching the "double-check in case of races" contract
    /// of `get_ready_tasks`.
    pub fn is_ready(&self, dependency_statuses: &HashMap<TaskId, TaskStatus>) -> bool {
        self.status == TaskStatus::Pending
        && self
        .depends_on
        .iter()
        .all(|dep| dependency_statuses.get(dep) == Some(&TaskStatus::Completed))
    }

    /// An agent matches a task iff it has no tag requirements, or the
    /// agent's advertised tags are a superset of the task's required tags.
    pub fn matches_tags(&self, agent_tags: &HashSet<String>) -> bool {
        self.tags.is_empty() || agent_tags.is_superset(&self.tags)
    }
}

/// Computed/self-reported status of an [`Agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Idle,
    Hung,
    Terminated,
}

/// A registered worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub role: String,
    pub working_on: String,
    pub capabilities: HashSet<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: AgentStatus,
}

impl Agent {
    pub fn new(
        role: impl Into<String>,
        name: impl Into<String>,
        working_on: impl Into<String>,
        capabilities: HashSet<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            name: name.into(),
            role: role.into(),
            working_on: working_on.into(),
            capabilities,
            registered_at: now,
            last_heartbeat: now,
            status: AgentStatus::Active,
        }
    }

    /// Computed liveness: a reader ignores the stored `status` for the
    /// hung determination and derives it from `last_heartbeat` alone.
    pub fn computed_status(&self, hung_after: chrono::Duration) -> AgentStatus {
        if self.status == AgentStatus::Terminated {
            return AgentStatus::Terminated;
        }
        if Utc::now() - self.last_heartbeat > hung_after {
            return AgentStatus::Hung;
        }
        self.status
    }
}

/// An exclusive, TTL-bounded lock on a canonical file path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLock {
    pub path: String,
    pub holder: AgentId,
    pub intent: String,
    pub lock_id: LockId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileLock {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Terminal state of an [`ApprovalRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub requestor: AgentId,
    pub action_type: String,
    pub description: String,
    pub required_roles: HashSet<String>,
    pub required_capabilities: HashSet<String>,
    pub min_approvals: u32,
    pub approvals: Vec<AgentId>,
    pub rejections: Vec<AgentId>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Priority of a [`Message`] posted to the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// Category of a [`Message`]. Channel adapters may use it to render
/// appropriately (an error might get a red accent, a question a mention);
/// the core itself is agnostic to rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Status,
    Error,
    Success,
    Question,
    Announcement,
}

/// A single message routed through the [`crate::board`] façade, either as
/// a board post, a channel broadcast, or a direct agent-to-agent message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    pub from_agent: AgentId,
    pub to_agent: Option<AgentId>,
    pub channel: Option<String>,
    pub priority: MessagePriority,
    pub message_type: MessageType,
    pub thread_id: Option<ThreadId>,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

/// One post within a [`BoardThread`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub author: AgentId,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub priority: MessagePriority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardThread {
    pub id: ThreadId,
    pub channel: String,
    pub title: String,
    pub created_by: AgentId,
    pub created_at: DateTime<Utc>,
    pub posts: Vec<Post>,
    pub pinned: bool,
}

/// An append-only record written by [`crate::audit::AuditLog`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub agent_id: Option<AgentId>,
    pub kind: String,
    pub context: String,
    pub reason: String,
}

/// Running per-model/per-agent LLM spend totals, backing
/// `llm:costs:tokens:{model}`, `llm:costs:dollars:{model}`, and
/// `llm:costs:by_agent:{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmCostEntry {
    pub model: String,
    pub agent_id: Option<AgentId>,
    pub tokens: u64,
    pub dollars: f64,
}

/// Escalation-event payload published to `channel:escalations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationEventPayload {
    pub event_type: &'static str,
    pub task_id: TaskId,
    pub task_title: String,
    pub reason: String,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
    pub claimed_by: Option<AgentId>,
}
