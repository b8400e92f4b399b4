//! Approval Workflow.
//!
//! A request collects approvals/rejections from agents until it reaches a
//! terminal state (`approved`, `rejected`, or `expired`); once terminal it
//! never moves again. Role/capability policy is left to
//! the caller: `approve`/`reject` take the acting agent's role and
//! capability set directly rather than this module reaching into the
//! registry, so callers can enforce whatever policy fits their deployment.

use crate::audit::AuditLog;
use crate::error::CoordError;
use crate::ids::{AgentId, ApprovalId};
use crate::kv::{keys, KvBackend};
use crate::models::ApprovalRequest;
use crate::models::ApprovalStatus;
use crate::Result;
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct ApprovalWorkflow {
    kv: Arc<dyn KvBackend>,
    audit: AuditLog,
}

impl ApprovalWorkflow {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            audit: AuditLog::new(kv.clone()),
            kv,
        }
    }

    async fn write(&self, request: &ApprovalRequest) -> Result<()> {
        let payload = serde_json::to_string(request)?;
        self.kv.set(&keys::approval(request.id), &payload).await
    }

    pub async fn get(&self, id: ApprovalId) -> Result<Option<ApprovalRequest>> {
        match self.kv.get(&keys::approval(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn require(&self, id: ApprovalId) -> Result<ApprovalRequest> {
        self.get(id)
        .await?
        .ok_or_else(|| CoordError::UnknownApproval(id.to_string()))
    }

    /// Creates a new approval request in the `pending` state.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        requestor: AgentId,
        action_type: impl Into<String>,
        description: impl Into<String>,
        required_roles: HashSet<String>,
        required_capabilities: HashSet<String>,
        min_approvals: u32,
        ttl_seconds: Option<i64>,
    ) -> Result<ApprovalId> {
        let now = Utc::now();
        let request = ApprovalRequest {
            id: ApprovalId::new(),
            requestor,
            action_type: action_type.into(),
            description: description.into(),
            required_roles,
            required_capabilities,
            min_approvals: min_approvals.max(1),
            approvals: Vec::new(),
            rejections: Vec::new(),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: ttl_seconds.map(|s| now + Duration::seconds(s)),
        };
        let id = request.id;
        self.write(&request).await?;
        self.kv.sadd(keys::APPROVALS_PENDING, &id.to_string()).await?;
        self.audit
        .record(Some(requestor), "approval_requested", id.to_string(), request.action_type.clone())
        .await?;
        info!(approval_id = %id, action_type = %request.action_type, "approval requested");
        Ok(id)
    }

    /// Lazily expires a request whose `expires_at` has passed, pulling it
    /// out of the pending index. Called on every read/decision path so a
    /// stale request never silently masquerades as pending.
    async fn expire_if_due(&self, request: &mut ApprovalRequest) -> Result<bool> {
        if request.status == ApprovalStatus::Pending {
            if let Some(expires_at) = request.expires_at {
                if Utc::now() >= expires_at {
                    request.status = ApprovalStatus::Expired;
                    self.write(request).await?;
                    self.kv
                    .srem(keys::APPROVALS_PENDING, &request.id.to_string())
                    .await?;
                    self.audit
                    .record(None, "approval_expired", request.id.to_string(), String::new())
                    .await?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn is_eligible(request: &ApprovalRequest, role: &str, capabilities: &HashSet<String>) -> bool {
        let role_ok = request.required_roles.is_empty() || request.required_roles.contains(role);
        let caps_ok = request
        .required_capabilities
        .iter()
        .all(|c| capabilities.contains(c));
        role_ok && caps_ok
    }

    /// Records an approval vote. Returns the request's post-decision status.
    pub async fn approve(
        &self,
        id: ApprovalId,
        approver: AgentId,
        approver_role: &str,
        approver_capabilities: &HashSet<String>,
    ) -> Result<ApprovalStatus> {
        let mut request = self.require(id).await?;
        if self.expire_if_due(&mut request).await? {
            return Ok(request.status);
        }
        if request.status != ApprovalStatus::Pending {
            return Ok(request.status);
        }
        if !Self::is_eligible(&request, approver_role, approver_capabilities) {
            return Err(CoordError::PermissionDenied(format!(
                        "agent {approver} is not eligible to decide on approval {id}"
            )));
        }
        if !request.approvals.contains(&approver) {
            request.approvals.push(approver);
        }

        if request.approvals.len() as u32 >= request.min_approvals {
            request.status = ApprovalStatus::Approved;
            self.kv.srem(keys::APPROVALS_PENDING, &id.to_string()).await?;
        }
        self.write(&request).await?;
        self.audit
        .record(Some(approver), "approval_decision", id.to_string(), "approved".to_string())
        .await?;
        Ok(request.status)
    }

    /// Records a rejection. A single rejection is terminal — any required
    /// approver may veto the whole request.
    pub async fn reject(
        &self,
        id: ApprovalId,
        rejector: AgentId,
        rejector_role: &str,
        rejector_capabilities: &HashSet<String>,
        reason: impl Into<String>,
    ) -> Result<ApprovalStatus> {
        let mut request = self.require(id).await?;
        if self.expire_if_due(&mut request).await? {
            return Ok(request.status);
        }
        if request.status != ApprovalStatus::Pending {
            return Ok(request.status);
        }
        if !Self::is_eligible(&request, rejector_role, rejector_capabilities) {
            return Err(CoordError::PermissionDenied(format!(
                        "agent {rejector} is not eligible to decide on approval {id}"
            )));
        }
        request.rejections.push(rejector);
        request.status = ApprovalStatus::Rejected;
        self.kv.srem(keys::APPROVALS_PENDING, &id.to_string()).await?;
        self.write(&request).await?;
        self.audit
        .record(Some(rejector), "approval_decision", id.to_string(), reason.into())
        .await?;
        Ok(request.status)
    }

    /// Polls until the request is terminal or `timeout` elapses. On
    /// timeout the request itself transitions to `expired`, even if its
    /// own `expires_at` deadline hasn't arrived yet — the caller's wait
    /// deadline is what expires it here.
    pub async fn wait_for_decision(
        &self,
        id: ApprovalId,
        timeout: std::time::Duration,
        poll_interval: std::time::Duration,
    ) -> Result<ApprovalStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut request = self.require(id).await?;
            self.expire_if_due(&mut request).await?;
            if request.status != ApprovalStatus::Pending {
                return Ok(request.status);
            }
            if tokio::time::Instant::now() >= deadline {
                request.status = ApprovalStatus::Expired;
                self.write(&request).await?;
                self.kv.srem(keys::APPROVALS_PENDING, &id.to_string()).await?;
                self.audit
                .record(None, "approval_expired", id.to_string(), "wait_for_decision timed out".to_string())
                .await?;
                return Ok(ApprovalStatus::Expired);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::time::sleep(poll_interval.min(remaining)).await;
        }
    }

    /// operation 5 / CLI surface.
    pub async fn list_pending(&self) -> Result<Vec<ApprovalRequest>> {
        let ids = self.kv.smembers(keys::APPROVALS_PENDING).await?;
        let mut out = Vec::new();
        for raw_id in ids {
            let Ok(id) = raw_id.parse::<ApprovalId>() else {
                continue;
            };
            if let Some(mut request) = self.get(id).await? {
                if self.expire_if_due(&mut request).await? {
                    continue;
                }
                if request.status == ApprovalStatus::Pending {
                    out.push(request);
                }
            }
        }
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::FileBackend;

    async fn workflow() -> ApprovalWorkflow {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(FileBackend::open(dir.into_path()).await.unwrap());
        ApprovalWorkflow::new(kv)
    }

    #[tokio::test]
    async fn single_approval_reaches_threshold() {
        let wf = workflow().await;
        let requestor = AgentId::new();
        let approver = AgentId::new();
        let id = wf
        .create(requestor, "deploy", "ship it", HashSet::new(), HashSet::new(), 1, None)
        .await
        .unwrap();
        let status = wf
        .approve(id, approver, "lead", &HashSet::new())
        .await
        .unwrap();
        assert_eq!(status, ApprovalStatus::Approved);
        assert!(wf.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejection_is_terminal_even_with_prior_approvals() {
        let wf = workflow().await;
        let requestor = AgentId::new();
        let a1 = AgentId::new();
        let a2 = AgentId::new();
        let id = wf
        .create(requestor, "deploy", "ship it", HashSet::new(), HashSet::new(), 2, None)
        .await
        .unwrap();
        wf.approve(id, a1, "lead", &HashSet::new()).await.unwrap();
        let status = wf
        .reject(id, a2, "lead", &HashSet::new(), "not ready")
        .await
        .unwrap();
        assert_eq!(status, ApprovalStatus::Rejected);
        // Further decisions against a terminal request are no-ops.
        let status_again = wf.approve(id, a1, "lead", &HashSet::new()).await.unwrap();
        assert_eq!(status_again, ApprovalStatus::Rejected);
    }

    #[tokio::test]
    async fn ineligible_role_is_denied() {
        let wf = workflow().await;
        let requestor = AgentId::new();
        let approver = AgentId::new();
        let id = wf
        .create(
            requestor,
            "deploy",
            "ship it",
            HashSet::from(["lead".to_string()]),
            HashSet::new(),
            1,
            None,
        )
        .await
        .unwrap();
        let err = wf
        .approve(id, approver, "intern", &HashSet::new())
        .await
        .unwrap_err();
        assert!(matches!(err, CoordError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn expired_request_is_terminal() {
        let wf = workflow().await;
        let requestor = AgentId::new();
        let approver = AgentId::new();
        let id = wf
        .create(requestor, "deploy", "ship it", HashSet::new(), HashSet::new(), 1, Some(0))
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let status = wf
        .approve(id, approver, "lead", &HashSet::new())
        .await
        .unwrap();
        assert_eq!(status, ApprovalStatus::Expired);
    }

    #[tokio::test]
    async fn wait_for_decision_observes_async_approval() {
        let wf = workflow().await;
        let requestor = AgentId::new();
        let approver = AgentId::new();
        let id = wf
        .create(requestor, "deploy", "ship it", HashSet::new(), HashSet::new(), 1, None)
        .await
        .unwrap();

        let wf2 = wf.clone();
        tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                wf2.approve(id, approver, "lead", &HashSet::new()).await.unwrap();
        });

        let status = wf
        .wait_for_decision(id, std::time::Duration::from_secs(1), std::time::Duration::from_millis(10))
        .await
        .unwrap();
        assert_eq!(status, ApprovalStatus::Approved);
    }
}
