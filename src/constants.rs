//! System-wide defaults for the coordination core.
//!
//! These are the fallback values used when the corresponding environment
//! variable (see [`crate::config`]) is unset.

/// Agents are expected to heartbeat on this cadence.
pub const DEFAULT_HEARTBEAT_SECONDS: u64 = 30;

/// An agent whose heartbeat is older than this is reported `hung` by
/// `detect_hung`.
pub const DEFAULT_HUNG_SECONDS: i64 = 300;

/// Default TTL for a newly acquired file lock.
pub const DEFAULT_LOCK_TTL_SECONDS: u64 = 600;

/// Default `max_retries` for a [`crate::models::Task`].
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default `retry_delay_base_seconds` for a task's retry policy.
pub const DEFAULT_RETRY_DELAY_BASE_SECONDS: u64 = 60;

/// Retry/backoff delays are capped at one hour.
pub const MAX_RETRY_DELAY_SECONDS: u64 = 3600;

/// How often the retry sweeper and reclamation sweeper run.
pub const DEFAULT_SWEEPER_INTERVAL_SECONDS: u64 = 60;

/// Auto-scaler evaluation period.
pub const DEFAULT_AUTOSCALER_INTERVAL_SECONDS: u64 = 30;

/// Auto-scaler idle grace before terminating a worker.
pub const DEFAULT_IDLE_GRACE_SECONDS: i64 = 120;

/// Lower bound of the blocking-claim poll backoff.
pub const CLAIM_POLL_MIN_MS: u64 = 50;

/// Upper bound of the blocking-claim poll backoff.
pub const CLAIM_POLL_MAX_MS: u64 = 2000;

/// Default poll interval for `wait_for_decision`.
pub const DEFAULT_APPROVAL_POLL_MS: u64 = 500;

/// Default single-approver threshold for a newly created approval request.
pub const DEFAULT_MIN_APPROVALS: u32 = 1;

/// Worker graceful-termination grace period before a forceful kill.
pub const DEFAULT_TERMINATE_GRACE_SECONDS: u64 = 10;

/// Name of the pub/sub channel escalations are published to.
pub const ESCALATION_CHANNEL: &str = "channel:escalations";

/// Audit log topic used by the core's own emitted events.
pub const AUDIT_TOPIC_DECISIONS: &str = "audit:decisions";
