//! Audit Log.
//!
//! Append-only, ordered record of decisions/events. Entries are never
//! modified or deleted by the core; ordering is the KV's own monotonic
//! sequence assignment, not a wall-clock
//! timestamp, so replay-from-cursor is exact even if two entries share a
//! timestamp.

use crate::ids::AgentId;
use crate::kv::{keys, KvBackend};
use crate::models::AuditEntry;
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct AuditLog {
    kv: Arc<dyn KvBackend>,
    topic: String,
}

impl AuditLog {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            kv,
            topic: keys::AUDIT_DECISIONS.to_string(),
        }
    }

    /// Append one entry and return its assigned sequence id. `sequence` on
    /// the passed-in fields is ignored; the backend assigns it.
    pub async fn record(
        &self,
        agent_id: Option<AgentId>,
        kind: impl Into<String>,
        context: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<u64> {
        let draft = AuditEntry {
            sequence: 0,
            timestamp: Utc::now(),
            agent_id,
            kind: kind.into(),
            context: context.into(),
            reason: reason.into(),
        };
        let payload = serde_json::to_string(&draft)?;
        let sequence = self.kv.stream_append(&self.topic, &payload).await?;
        debug!(sequence, kind = %draft.kind, "audit entry recorded");
        Ok(sequence)
    }

    /// Entries with sequence strictly greater than `cursor`, in order.
    pub async fn read_from(&self, cursor: u64, limit: Option<usize>) -> Result<Vec<AuditEntry>> {
        let raw = self.kv.stream_read(&self.topic, cursor, limit).await?;
        let mut out = Vec::with_capacity(raw.len());
        for (sequence, payload) in raw {
            let mut entry: AuditEntry = serde_json::from_str(&payload)?;
            entry.sequence = sequence;
            out.push(entry);
        }
        Ok(out)
    }
}
