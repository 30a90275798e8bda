//! Approval orchestrator: create, decide, cancel, assign, list, and expire
//! approval requests.
//!
//! Owns every `Approval` record; the workflow executor only holds approval
//! ids. Concurrent decisions on the same approval are serialized by a
//! per-approval lock -- the first decision wins, the second fails with
//! `AlreadyResolved`. A terminal status is never re-opened.

use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use studio_types::approval::{
    Approval, ApprovalDecision, ApprovalFilter, ApprovalPage, ApprovalStatus,
    CreateApprovalRequest, Decision, DEFAULT_APPROVAL_TIMEOUT_SECS, MAX_APPROVAL_TIMEOUT_SECS,
    MIN_APPROVAL_TIMEOUT_SECS,
};
use studio_types::event::WorkflowEvent;
use studio_types::workflow::TimeoutBehavior;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::approval::ApprovalStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval not found: {0}")]
    NotFound(Uuid),

    #[error("approval {0} is already resolved")]
    AlreadyResolved(Uuid),

    #[error("approval store error: {0}")]
    Store(String),

    #[error("invalid request: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Notification sink port
// ---------------------------------------------------------------------------

/// Best-effort notification delivery for newly created approvals.
pub trait NotificationSink: Send + Sync {
    fn notify<'a>(&'a self, approval: &'a Approval, channel: &'a str) -> BoxFuture<'a, ()>;
}

/// Sink that only logs. Used when no external channel is wired.
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn notify<'a>(&'a self, approval: &'a Approval, channel: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::info!(
                approval_id = %approval.id,
                thread_id = approval.thread_id.as_str(),
                channel,
                "approval notification"
            );
        })
    }
}

// ---------------------------------------------------------------------------
// ApprovalService
// ---------------------------------------------------------------------------

/// The approval orchestrator.
pub struct ApprovalService<S: ApprovalStore> {
    store: S,
    events: EventBus,
    sink: Arc<dyn NotificationSink>,
    /// Per-approval locks serializing decide/cancel/expire races.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl<S: ApprovalStore> ApprovalService<S> {
    pub fn new(store: S, events: EventBus, sink: Arc<dyn NotificationSink>) -> Self {
        Self { store, events, sink, locks: DashMap::new() }
    }

    fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Direct store access for test fixtures.
    #[cfg(test)]
    pub(crate) fn store_for_tests(&self) -> &S {
        &self.store
    }

    /// Create a new approval request. Status begins `pending`;
    /// `expiresAt = requestedAt + timeoutSeconds` unless the behavior is
    /// `infinite`. Emits `approval:created` and notifies the sink.
    pub async fn create(&self, req: CreateApprovalRequest) -> Result<Approval, ApprovalError> {
        if req.prompt.is_empty() {
            return Err(ApprovalError::Invalid("prompt must not be empty".to_string()));
        }

        let timeout_behavior = req.timeout_behavior.unwrap_or_default();
        let timeout_secs = req
            .timeout_seconds
            .unwrap_or(DEFAULT_APPROVAL_TIMEOUT_SECS)
            .clamp(MIN_APPROVAL_TIMEOUT_SECS, MAX_APPROVAL_TIMEOUT_SECS);

        let requested_at = Utc::now();
        let expires_at = match timeout_behavior {
            TimeoutBehavior::Infinite => None,
            _ => Some(requested_at + Duration::seconds(timeout_secs as i64)),
        };

        let approval = Approval {
            id: Uuid::now_v7(),
            thread_id: req.thread_id,
            step_id: req.step_id,
            project_id: req.project_id,
            prompt: req.prompt,
            risk_level: req.risk_level.unwrap_or_default(),
            status: ApprovalStatus::Pending,
            timeout_behavior,
            requested_at,
            expires_at,
            resolved_by: None,
            resolved_at: None,
            decision_comment: None,
            assigned_to: None,
            context_data: req.context_data,
        };

        self.store
            .insert(&approval)
            .await
            .map_err(|e| ApprovalError::Store(e.to_string()))?;

        self.events.publish(WorkflowEvent::ApprovalCreated {
            approval_id: approval.id,
            thread_id: approval.thread_id.clone(),
            step_id: approval.step_id.clone(),
            expires_at: approval.expires_at,
        });
        self.sink.notify(&approval, "default").await;

        tracing::info!(
            approval_id = %approval.id,
            thread_id = approval.thread_id.as_str(),
            step_id = approval.step_id.as_str(),
            "approval created"
        );

        Ok(approval)
    }

    /// Resolve a pending approval. Fails with `AlreadyResolved` if a terminal
    /// decision has already been recorded. Emits `approval:resolved`.
    pub async fn decide(
        &self,
        id: Uuid,
        decision: ApprovalDecision,
    ) -> Result<Approval, ApprovalError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut approval = self.get(id).await?;
        if approval.is_terminal() {
            return Err(ApprovalError::AlreadyResolved(id));
        }

        approval.status = match decision.decision {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject => ApprovalStatus::Rejected,
        };
        approval.resolved_by = Some(decision.decided_by.clone());
        approval.resolved_at = Some(Utc::now());
        approval.decision_comment = decision.comment;

        self.store
            .update(&approval)
            .await
            .map_err(|e| ApprovalError::Store(e.to_string()))?;

        self.events.publish(WorkflowEvent::ApprovalResolved {
            approval_id: approval.id,
            thread_id: approval.thread_id.clone(),
            step_id: approval.step_id.clone(),
            approved: approval.status == ApprovalStatus::Approved,
            resolved_by: decision.decided_by,
        });

        Ok(approval)
    }

    /// Cancel a pending approval. Fails unless the approval is `pending`.
    pub async fn cancel(&self, id: Uuid, by: &str) -> Result<Approval, ApprovalError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut approval = self.get(id).await?;
        if approval.status != ApprovalStatus::Pending {
            return Err(ApprovalError::AlreadyResolved(id));
        }

        approval.status = ApprovalStatus::Cancelled;
        approval.resolved_by = Some(by.to_string());
        approval.resolved_at = Some(Utc::now());

        self.store
            .update(&approval)
            .await
            .map_err(|e| ApprovalError::Store(e.to_string()))?;

        self.events.publish(WorkflowEvent::ApprovalResolved {
            approval_id: approval.id,
            thread_id: approval.thread_id.clone(),
            step_id: approval.step_id.clone(),
            approved: false,
            resolved_by: by.to_string(),
        });

        Ok(approval)
    }

    /// Assign a pending approval to a user for notification routing.
    pub async fn assign(&self, id: Uuid, assignee: &str) -> Result<Approval, ApprovalError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut approval = self.get(id).await?;
        if approval.is_terminal() {
            return Err(ApprovalError::AlreadyResolved(id));
        }
        approval.assigned_to = Some(assignee.to_string());
        self.store
            .update(&approval)
            .await
            .map_err(|e| ApprovalError::Store(e.to_string()))?;
        Ok(approval)
    }

    pub async fn get(&self, id: Uuid) -> Result<Approval, ApprovalError> {
        self.store
            .get(&id)
            .await
            .map_err(|e| ApprovalError::Store(e.to_string()))?
            .ok_or(ApprovalError::NotFound(id))
    }

    pub async fn list(
        &self,
        filter: &ApprovalFilter,
        page: u32,
        page_size: u32,
    ) -> Result<ApprovalPage, ApprovalError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 200);
        self.store
            .list(filter, page, page_size)
            .await
            .map_err(|e| ApprovalError::Store(e.to_string()))
    }

    /// Idempotent expiry sweep: every `pending` approval past `expiresAt`
    /// becomes `expired` and `approval:expired` is emitted. Approvals with
    /// `timeout_behavior = infinite` carry no deadline and are never swept.
    ///
    /// Returns the approvals expired by this sweep.
    pub async fn process_expired(&self) -> Result<Vec<Approval>, ApprovalError> {
        let now = Utc::now();
        let candidates = self
            .store
            .list_expired(now)
            .await
            .map_err(|e| ApprovalError::Store(e.to_string()))?;

        let mut expired = Vec::new();
        for candidate in candidates {
            let lock = self.lock_for(candidate.id);
            let _guard = lock.lock().await;

            // Re-read under the lock; a decision may have landed meanwhile.
            let mut approval = self.get(candidate.id).await?;
            if approval.is_terminal() {
                continue;
            }

            approval.status = ApprovalStatus::Expired;
            approval.resolved_at = Some(now);
            self.store
                .update(&approval)
                .await
                .map_err(|e| ApprovalError::Store(e.to_string()))?;

            self.events.publish(WorkflowEvent::ApprovalExpired {
                approval_id: approval.id,
                thread_id: approval.thread_id.clone(),
                step_id: approval.step_id.clone(),
            });

            tracing::info!(
                approval_id = %approval.id,
                thread_id = approval.thread_id.as_str(),
                behavior = ?approval.timeout_behavior,
                "approval expired"
            );
            expired.push(approval);
        }

        Ok(expired)
    }
}

// ---------------------------------------------------------------------------
// ApprovalGate (engine-facing port)
// ---------------------------------------------------------------------------

/// The narrow surface the human step executor needs, object-safe so the
/// executor registry can hold it behind `Arc<dyn>`.
pub trait ApprovalGate: Send + Sync {
    /// Create an approval for a waiting step.
    fn open(
        &self,
        req: CreateApprovalRequest,
    ) -> BoxFuture<'_, Result<Approval, ApprovalError>>;

    /// The most recent approval for a `(threadId, stepId)` pair.
    fn find_for_step<'a>(
        &'a self,
        thread_id: &'a str,
        step_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Approval>, ApprovalError>>;
}

impl<S: ApprovalStore> ApprovalGate for ApprovalService<S> {
    fn open(&self, req: CreateApprovalRequest) -> BoxFuture<'_, Result<Approval, ApprovalError>> {
        Box::pin(self.create(req))
    }

    fn find_for_step<'a>(
        &'a self,
        thread_id: &'a str,
        step_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Approval>, ApprovalError>> {
        Box::pin(async move {
            self.store
                .find_for_step(thread_id, step_id)
                .await
                .map_err(|e| ApprovalError::Store(e.to_string()))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryApprovalStore;
    use studio_types::approval::RiskLevel;

    fn service() -> ApprovalService<InMemoryApprovalStore> {
        ApprovalService::new(
            InMemoryApprovalStore::new(),
            EventBus::new(64),
            Arc::new(LogNotificationSink),
        )
    }

    fn request(thread_id: &str) -> CreateApprovalRequest {
        CreateApprovalRequest {
            thread_id: thread_id.to_string(),
            step_id: "review".to_string(),
            project_id: None,
            prompt: "Ship it?".to_string(),
            risk_level: Some(RiskLevel::High),
            timeout_seconds: Some(600),
            timeout_behavior: Some(TimeoutBehavior::Fail),
            context_data: None,
        }
    }

    fn approve(by: &str) -> ApprovalDecision {
        ApprovalDecision {
            decision: Decision::Approve,
            decided_by: by.to_string(),
            comment: Some("lgtm".to_string()),
        }
    }

    #[tokio::test]
    async fn create_sets_pending_and_deadline() {
        let svc = service();
        let approval = svc.create(request("t-1")).await.unwrap();
        assert_eq!(approval.status, ApprovalStatus::Pending);
        let deadline = approval.expires_at.unwrap();
        let delta = (deadline - approval.requested_at).num_seconds();
        assert_eq!(delta, 600);
    }

    #[tokio::test]
    async fn create_clamps_timeout_bounds() {
        let svc = service();
        let mut req = request("t-1");
        req.timeout_seconds = Some(5);
        let approval = svc.create(req).await.unwrap();
        let delta = (approval.expires_at.unwrap() - approval.requested_at).num_seconds();
        assert_eq!(delta, MIN_APPROVAL_TIMEOUT_SECS as i64);

        let mut req = request("t-2");
        req.timeout_seconds = Some(1_000_000);
        let approval = svc.create(req).await.unwrap();
        let delta = (approval.expires_at.unwrap() - approval.requested_at).num_seconds();
        assert_eq!(delta, MAX_APPROVAL_TIMEOUT_SECS as i64);
    }

    #[tokio::test]
    async fn infinite_behavior_has_no_deadline() {
        let svc = service();
        let mut req = request("t-1");
        req.timeout_behavior = Some(TimeoutBehavior::Infinite);
        let approval = svc.create(req).await.unwrap();
        assert!(approval.expires_at.is_none());
    }

    #[tokio::test]
    async fn create_emits_event() {
        let svc = service();
        let mut rx = svc.events.subscribe();
        let approval = svc.create(request("t-1")).await.unwrap();
        let event = rx.recv().await.unwrap();
        match event {
            WorkflowEvent::ApprovalCreated { approval_id, .. } => {
                assert_eq!(approval_id, approval.id);
            }
            other => panic!("expected approval:created, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn decide_resolves_and_is_single_shot() {
        let svc = service();
        let approval = svc.create(request("t-1")).await.unwrap();

        let resolved = svc.decide(approval.id, approve("alice")).await.unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("alice"));
        assert!(resolved.resolved_at.is_some());

        // Second decision loses.
        let err = svc.decide(approval.id, approve("bob")).await.unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyResolved(_)));
    }

    #[tokio::test]
    async fn concurrent_decides_serialize_first_wins() {
        let svc = Arc::new(service());
        let approval = svc.create(request("t-1")).await.unwrap();

        let a = {
            let svc = Arc::clone(&svc);
            let id = approval.id;
            tokio::spawn(async move { svc.decide(id, approve("alice")).await })
        };
        let b = {
            let svc = Arc::clone(&svc);
            let id = approval.id;
            tokio::spawn(async move { svc.decide(id, approve("bob")).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let losses = results
            .iter()
            .filter(|r| matches!(r, Err(ApprovalError::AlreadyResolved(_))))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(losses, 1);
    }

    #[tokio::test]
    async fn cancel_requires_pending() {
        let svc = service();
        let approval = svc.create(request("t-1")).await.unwrap();
        svc.decide(approval.id, approve("alice")).await.unwrap();

        let err = svc.cancel(approval.id, "ops").await.unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyResolved(_)));
    }

    #[tokio::test]
    async fn assign_records_assignee() {
        let svc = service();
        let approval = svc.create(request("t-1")).await.unwrap();
        let assigned = svc.assign(approval.id, "carol").await.unwrap();
        assert_eq!(assigned.assigned_to.as_deref(), Some("carol"));
    }

    #[tokio::test]
    async fn process_expired_sweeps_only_overdue_pending() {
        let svc = service();
        let mut req = request("t-1");
        req.timeout_seconds = Some(60);
        let overdue = svc.create(req).await.unwrap();

        // Force the deadline into the past via the store.
        let mut record = svc.get(overdue.id).await.unwrap();
        record.expires_at = Some(Utc::now() - Duration::seconds(10));
        svc.store.update(&record).await.unwrap();

        let fresh = svc.create(request("t-2")).await.unwrap();

        let expired = svc.process_expired().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, overdue.id);
        assert_eq!(svc.get(overdue.id).await.unwrap().status, ApprovalStatus::Expired);
        assert_eq!(svc.get(fresh.id).await.unwrap().status, ApprovalStatus::Pending);

        // Idempotent: a second sweep finds nothing.
        assert!(svc.process_expired().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_approval_cannot_be_decided() {
        let svc = service();
        let approval = svc.create(request("t-1")).await.unwrap();
        let mut record = svc.get(approval.id).await.unwrap();
        record.expires_at = Some(Utc::now() - Duration::seconds(1));
        svc.store.update(&record).await.unwrap();
        svc.process_expired().await.unwrap();

        let err = svc.decide(approval.id, approve("late")).await.unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyResolved(_)));
    }

    #[tokio::test]
    async fn gate_find_for_step_returns_latest() {
        let svc = service();
        let created = svc.create(request("t-1")).await.unwrap();
        let found = ApprovalGate::find_for_step(&svc, "t-1", "review")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);
        assert!(ApprovalGate::find_for_step(&svc, "t-1", "other")
            .await
            .unwrap()
            .is_none());
    }
}
