//! Agent Registry.
//!
//! Registration, heartbeating, enumeration with computed liveness, and
//! hung detection. Only the owning agent ever writes its own heartbeat;
//! readers never mutate a record.

use crate::error::CoordError;
use crate::ids::AgentId;
use crate::kv::{keys, KvBackend};
use crate::models::{Agent, AgentStatus};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Façade over the KV for agent registration, heartbeats, and liveness.
#[derive(Clone)]
pub struct AgentRegistry {
    kv: Arc<dyn KvBackend>,
    hung_after: Duration,
}

impl AgentRegistry {
    pub fn new(kv: Arc<dyn KvBackend>, hung_after_seconds: i64) -> Self {
        Self {
            kv,
            hung_after: Duration::seconds(hung_after_seconds),
        }
    }

    /// Allocates a new agent id and writes its record. Not idempotent on
    /// repeated calls with the same human name — each call mints a fresh
    /// id; re-registration under the *same* id (e.g. a worker restarting
    /// with a persisted id) is handled by [`AgentRegistry::heartbeat`]
    /// being a no-op on unchanged fields.
    pub async fn register(
        &self,
        role: impl Into<String>,
        name: impl Into<String>,
        working_on: impl Into<String>,
        capabilities: HashSet<String>,
    ) -> Result<AgentId> {
        let agent = Agent::new(role, name, working_on, capabilities);
        let id = agent.id;
        self.write(&agent).await?;
        self.kv.sadd(keys::AGENTS_INDEX, &id.to_string()).await?;
        info!(agent_id = %id, name = %agent.name, role = %agent.role, "agent registered");
        Ok(id)
    }

    async fn write(&self, agent: &Agent) -> Result<()> {
        let payload = serde_json::to_string(agent)?;
        self.kv.set(&keys::agent(agent.id), &payload).await
    }

    async fn read(&self, id: AgentId) -> Result<Option<Agent>> {
        match self.kv.get(&keys::agent(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Updates `last_heartbeat` and optionally `working_on`. All other
    /// fields are left untouched — repeated heartbeats are idempotent on
    /// everything except the timestamp.
    pub async fn heartbeat(&self, id: AgentId, working_on: Option<String>) -> Result<()> {
        let mut agent = self
        .read(id)
        .await?
        .ok_or_else(|| CoordError::UnknownAgent(id.to_string()))?;
        agent.last_heartbeat = Utc::now();
        if agent.status == AgentStatus::Hung {
            agent.status = AgentStatus::Active;
        }
        if let Some(working_on) = working_on {
            agent.working_on = working_on;
        }
        self.write(&agent).await?;
        debug!(agent_id = %id, "heartbeat");
        Ok(())
    }

    /// All known agents, with `status` recomputed from `last_heartbeat`
    /// rather than trusting the stored field.
    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        let ids = self.kv.smembers(keys::AGENTS_INDEX).await?;
        let mut agents = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let Ok(id) = raw_id.parse::<AgentId>() else {
                continue;
            };
            if let Some(mut agent) = self.read(id).await? {
                agent.status = agent.computed_status(self.hung_after);
                agents.push(agent);
            }
        }
        agents.sort_by_key(|a| a.registered_at);
        Ok(agents)
    }

    /// Convenience lookup for a single agent with computed status.
    pub async fn get(&self, id: AgentId) -> Result<Option<Agent>> {
        Ok(self.read(id).await?.map(|mut a| {
                    a.status = a.computed_status(self.hung_after);
                    a
        }))
    }

    /// Ids of every agent whose heartbeat is older than `threshold_seconds`.
    pub async fn detect_hung(&self, threshold_seconds: i64) -> Result<Vec<AgentId>> {
        let threshold = Duration::seconds(threshold_seconds);
        let now = Utc::now();
        let agents = self.list_agents().await?;
        Ok(agents
            .into_iter()
            .filter(|a| a.status != AgentStatus::Terminated && now - a.last_heartbeat > threshold)
            .map(|a| a.id)
            .collect())
    }

    /// Marks `terminated`; the record is kept (not deleted) for audit
    /// retention,
    pub async fn deregister(&self, id: AgentId) -> Result<()> {
        let mut agent = self
        .read(id)
        .await?
        .ok_or_else(|| CoordError::UnknownAgent(id.to_string()))?;
        agent.status = AgentStatus::Terminated;
        self.write(&agent).await?;
        info!(agent_id = %id, "agent deregistered");
        Ok(())
    }

    /// Whether `last_heartbeat` for `id` is stale, used by sweepers that
    /// need a cheap yes/no without paying for `computed_status` string
    /// plumbing.
    pub async fn is_hung(&self, id: AgentId) -> Result<bool> {
        match self.read(id).await? {
            Some(agent) => Ok(Utc::now() - agent.last_heartbeat > self.hung_after),
            None => {
                warn!(agent_id = %id, "hung-check against unknown agent");
                Ok(true)
            }
        }
    }

    pub async fn last_heartbeat(&self, id: AgentId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read(id).await?.map(|a| a.last_heartbeat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::FileBackend;
    use std::collections::HashSet;

    async fn registry(hung_after: i64) -> AgentRegistry {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(FileBackend::open(dir.into_path()).await.unwrap());
        AgentRegistry::new(kv, hung_after)
    }

    #[tokio::test]
    async fn register_then_list_reports_active() {
        let reg = registry(300).await;
        let id = reg
        .register("developer", "alice", "idle", HashSet::new())
        .await
        .unwrap();
        let agents = reg.list_agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, id);
        assert_eq!(agents[0].status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn unknown_agent_heartbeat_fails() {
        let reg = registry(300).await;
        let bogus = AgentId::new();
        let err = reg.heartbeat(bogus, None).await.unwrap_err();
        assert!(matches!(err, CoordError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn stale_heartbeat_is_reported_hung_regardless_of_stored_status() {
        let reg = registry(0).await;
        let id = reg
        .register("developer", "bob", "idle", HashSet::new())
        .await
        .unwrap();
        // hung_after=0 means any elapsed time counts as stale.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let agents = reg.list_agents().await.unwrap();
        assert_eq!(agents[0].status, AgentStatus::Hung);
        assert!(reg.detect_hung(0).await.unwrap().contains(&id));
    }

    #[tokio::test]
    async fn heartbeat_is_idempotent_on_other_fields() {
        let reg = registry(300).await;
        let id = reg
        .register("developer", "carol", "task-a", HashSet::new())
        .await
        .unwrap();
        reg.heartbeat(id, None).await.unwrap();
        let agent = reg.get(id).await.unwrap().unwrap();
        assert_eq!(agent.working_on, "task-a");
        assert_eq!(agent.name, "carol");
    }

    #[tokio::test]
    async fn deregister_marks_terminated_not_deleted() {
        let reg = registry(300).await;
        let id = reg
        .register("developer", "dave", "idle", HashSet::new())
        .await
        .unwrap();
        reg.deregister(id).await.unwrap();
        let agent = reg.get(id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Terminated);
    }
}
