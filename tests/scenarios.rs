//! End-to-end scenarios (tag routing, lock contention, multi-approver
//! gating) driven through the
//! [`agentcoord_core::session::CoordinationSession`] façade against the
//! file-backed fallback, exercising several subsystems together the way a
//! real deployment would rather than in isolation.

use agentcoord_core::kv::FileBackend;
use agentcoord_core::models::{ApprovalStatus, RetryPolicy};
use agentcoord_core::session::{CoordinationSession, SessionOptions};
use std::collections::HashSet;
use std::sync::Arc;

async fn kv() -> Arc<dyn agentcoord_core::kv::KvBackend> {
    let dir = tempfile::tempdir().unwrap();
    Arc::new(FileBackend::open(dir.into_path()).await.unwrap())
}

fn quiet_heartbeat() -> SessionOptions {
    SessionOptions {
        heartbeat_interval_seconds: 3600,
        ..Default::default()
    }
}

#[tokio::test]
async fn tag_routing_through_two_sessions() {
    let kv = kv().await;
    let backend_session = CoordinationSession::start(
        kv.clone(),
        "worker",
        "backend-worker",
        "waiting",
        HashSet::from(["backend".to_string()]),
        quiet_heartbeat(),
    )
    .await
    .unwrap();
    let frontend_session = CoordinationSession::start(
        kv.clone(),
        "worker",
        "frontend-worker",
        "waiting",
        HashSet::from(["frontend".to_string()]),
        quiet_heartbeat(),
    )
    .await
    .unwrap();

    let backend_task = backend_session
        .queue()
        .create_task(
            "fix api",
            "desc",
            0,
            HashSet::from(["backend".to_string()]),
            HashSet::new(),
            RetryPolicy::None,
            3,
            60,
        )
        .await
        .unwrap();
    let frontend_task = backend_session
        .queue()
        .create_task(
            "fix layout",
            "desc",
            0,
            HashSet::from(["frontend".to_string()]),
            HashSet::new(),
            RetryPolicy::None,
            3,
            60,
        )
        .await
        .unwrap();

    let backend_tags = HashSet::from(["backend".to_string()]);
    let frontend_tags = HashSet::from(["frontend".to_string()]);

    let claimed_by_backend = backend_session
        .queue()
        .claim_task(backend_session.agent_id(), Some(&backend_tags))
        .await
        .unwrap()
        .unwrap();
    let claimed_by_frontend = frontend_session
        .queue()
        .claim_task(frontend_session.agent_id(), Some(&frontend_tags))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(claimed_by_backend.id, backend_task);
    assert_eq!(claimed_by_frontend.id, frontend_task);

    backend_session.end().await.unwrap();
    frontend_session.end().await.unwrap();
}

#[tokio::test]
async fn lock_contention_then_release_then_ttl_expiry() {
    let kv = kv().await;
    let session_a = CoordinationSession::start(kv.clone(), "worker", "a", "editing", HashSet::new(), quiet_heartbeat())
        .await
        .unwrap();
    let session_b = CoordinationSession::start(kv.clone(), "worker", "b", "editing", HashSet::new(), quiet_heartbeat())
        .await
        .unwrap();

    let guard = session_a.scoped_lock("shared/config.yaml", "edit").await.unwrap();
    let busy = session_b.locks().lock_file("shared/config.yaml", "edit", session_b.agent_id(), None).await;
    assert!(matches!(busy, Err(agentcoord_core::CoordError::LockBusy { .. })));

    guard.release().await.unwrap();
    session_b
        .locks()
        .lock_file("shared/config.yaml", "edit", session_b.agent_id(), None)
        .await
        .unwrap();

    session_a.end().await.unwrap();
    session_b.end().await.unwrap();
}

#[tokio::test]
async fn multi_approver_gate_reject_beats_later_approve() {
    let kv = kv().await;
    let requestor = CoordinationSession::start(kv.clone(), "lead", "requestor", "requesting", HashSet::new(), quiet_heartbeat())
        .await
        .unwrap();
    let x = CoordinationSession::start(kv.clone(), "lead", "x", "reviewing", HashSet::new(), quiet_heartbeat())
        .await
        .unwrap();
    let y = CoordinationSession::start(kv.clone(), "lead", "y", "reviewing", HashSet::new(), quiet_heartbeat())
        .await
        .unwrap();
    let z = CoordinationSession::start(kv.clone(), "lead", "z", "reviewing", HashSet::new(), quiet_heartbeat())
        .await
        .unwrap();

    let id = requestor
        .approvals()
        .create(requestor.agent_id(), "deploy", "ship the release", HashSet::new(), HashSet::new(), 2, None)
        .await
        .unwrap();

    let status = x.approvals().approve(id, x.agent_id(), "lead", &HashSet::new()).await.unwrap();
    assert_eq!(status, ApprovalStatus::Pending);

    let status = y
        .approvals()
        .reject(id, y.agent_id(), "lead", &HashSet::new(), "not ready")
        .await
        .unwrap();
    assert_eq!(status, ApprovalStatus::Rejected);

    // z's later approval cannot revive a rejected request.
    let status = z.approvals().approve(id, z.agent_id(), "lead", &HashSet::new()).await.unwrap();
    assert_eq!(status, ApprovalStatus::Rejected);

    // A fresh request with x and z approving reaches the threshold.
    let fresh_id = requestor
        .approvals()
        .create(requestor.agent_id(), "deploy", "ship the release v2", HashSet::new(), HashSet::new(), 2, None)
        .await
        .unwrap();
    x.approvals().approve(fresh_id, x.agent_id(), "lead", &HashSet::new()).await.unwrap();
    let status = z.approvals().approve(fresh_id, z.agent_id(), "lead", &HashSet::new()).await.unwrap();
    assert_eq!(status, ApprovalStatus::Approved);

    // A request whose own TTL elapses before any decision flips to expired,
    // and wait_for_decision observes that flip rather than timing out blind.
    let timeout_id = requestor
        .approvals()
        .create(requestor.agent_id(), "deploy", "ship the release v3", HashSet::new(), HashSet::new(), 1, Some(0))
        .await
        .unwrap();
    let status = requestor
        .approvals()
        .wait_for_decision(timeout_id, std::time::Duration::from_secs(1), std::time::Duration::from_millis(5))
        .await
        .unwrap();
    assert_eq!(status, ApprovalStatus::Expired);

    requestor.end().await.unwrap();
    x.end().await.unwrap();
    y.end().await.unwrap();
    z.end().await.unwrap();
}
