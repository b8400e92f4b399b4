//! Central key-schema. Every other module reaches `task:{id}` etc.
//! through these helpers instead of formatting ad hoc strings, so the
//! schema only needs to be correct in one place.

use crate::ids::{AgentId, ApprovalId, LockId, TaskId, ThreadId};

pub fn task(id: TaskId) -> String {
    format!("task:{id}")
}

pub const TASKS_PENDING: &str = "tasks:pending";
pub const TASKS_RETRY: &str = "tasks:retry";
pub const TASKS_ESCALATED: &str = "tasks:escalated";
pub const TASKS_DLQ: &str = "tasks:dlq";
/// Not named's table, but needed to enumerate every task ever
/// created for `get_dependency_graph` and the CLI listing surface;
/// the other indices are all partitioned by status/agent, none
/// gives a complete id set.
pub const TASKS_ALL: &str = "tasks:all";

pub fn tasks_by_agent(agent_id: AgentId) -> String {
    format!("tasks:by_agent:{agent_id}")
}

pub fn tasks_dependents(task_id: TaskId) -> String {
    format!("tasks:dependents:{task_id}")
}

/// `lock:{canonical_path}` — the path is never embedded verbatim since it
/// may contain `:`; we hex-encode it so the key stays a single KV token.
pub fn lock(canonical_path: &str) -> String {
    format!("lock:{}", hex_encode(canonical_path.as_bytes()))
}

/// Not part of the public key schema (an implementation detail of
/// [`LockId`] bookkeeping), but used internally to track which path a
/// `lock_id` refers to without round-tripping the whole `FileLock`.
pub fn lock_owner(lock_id: LockId) -> String {
    format!("lock_owner:{lock_id}")
}

pub fn agent(id: AgentId) -> String {
    format!("agent:{id}")
}

pub const AGENTS_INDEX: &str = "agents:index";

pub fn approval(id: ApprovalId) -> String {
    format!("approval:{id}")
}

pub const APPROVALS_PENDING: &str = "approvals:pending";

pub fn board_thread(id: ThreadId) -> String {
    format!("board:thread:{id}")
}

pub const BOARD_THREADS_INDEX: &str = "board:threads:index";

pub const AUDIT_DECISIONS: &str = "audit:decisions";

pub const LLM_SEMAPHORE: &str = "llm:semaphore";
/// Running daily spend total in dollars, as a formatted string for easy
/// reading via `coordctl`; the authoritative integer accumulator is
/// [`LLM_SEMAPHORE_SPEND_CENTS`].
pub const LLM_SEMAPHORE_SPEND: &str = "llm:semaphore:spend";
/// Spend accumulated in integer cents, since [`KvBackend::incrby`] only
/// operates on integers.
pub const LLM_SEMAPHORE_SPEND_CENTS: &str = "llm:semaphore:spend_cents";

pub fn llm_costs_tokens(model: &str) -> String {
    format!("llm:costs:tokens:{model}")
}

pub fn llm_costs_dollars(model: &str) -> String {
    format!("llm:costs:dollars:{model}")
}

pub fn llm_costs_by_agent(agent_id: AgentId) -> String {
    format!("llm:costs:by_agent:{agent_id}")
}

pub const CHANNEL_ESCALATIONS: &str = "channel:escalations";

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
