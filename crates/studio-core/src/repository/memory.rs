//! In-memory store implementations.
//!
//! Back the engine in tests and in ephemeral deployments where durability is
//! not required. Behavior matches the SQLite adapters in `studio-infra`:
//! `save` is an atomic whole-document replace, listings are newest-first.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use studio_types::approval::{Approval, ApprovalFilter, ApprovalPage, ApprovalStatus};
use studio_types::error::RepositoryError;
use studio_types::workflow::{ThreadSummary, WorkflowState};
use uuid::Uuid;

use super::approval::ApprovalStore;
use super::workflow::{ThreadFilter, WorkflowStateStore};

// ---------------------------------------------------------------------------
// InMemoryStateStore
// ---------------------------------------------------------------------------

/// In-memory `WorkflowStateStore`.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    threads: DashMap<String, WorkflowState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowStateStore for InMemoryStateStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), RepositoryError> {
        self.threads.insert(state.thread_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<WorkflowState>, RepositoryError> {
        Ok(self.threads.get(thread_id).map(|s| s.clone()))
    }

    async fn list(&self, filter: &ThreadFilter) -> Result<Vec<ThreadSummary>, RepositoryError> {
        let mut summaries: Vec<ThreadSummary> = self
            .threads
            .iter()
            .filter(|entry| {
                let state = entry.value();
                filter
                    .project_id
                    .as_ref()
                    .is_none_or(|p| state.project_id.as_deref() == Some(p.as_str()))
                    && filter.status.is_none_or(|s| state.status == s)
            })
            .map(|entry| {
                let state = entry.value();
                ThreadSummary {
                    thread_id: state.thread_id.clone(),
                    status: state.status,
                    project_id: state.project_id.clone(),
                    started_at: state.created_at,
                    last_update: state.updated_at,
                    step_statuses: state.step_status.clone(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| b.last_update.cmp(&a.last_update));
        Ok(summaries)
    }

    async fn delete(&self, thread_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.threads.remove(thread_id).is_some())
    }
}

// ---------------------------------------------------------------------------
// InMemoryApprovalStore
// ---------------------------------------------------------------------------

/// In-memory `ApprovalStore`.
#[derive(Debug, Default)]
pub struct InMemoryApprovalStore {
    approvals: DashMap<Uuid, Approval>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(filter: &ApprovalFilter, approval: &Approval) -> bool {
        if let Some(project) = &filter.project_id {
            if approval.project_id.as_deref() != Some(project.as_str()) {
                return false;
            }
        }
        if !filter.status.is_empty() && !filter.status.contains(&approval.status) {
            return false;
        }
        if let Some(risk) = filter.risk_level {
            if approval.risk_level != risk {
                return false;
            }
        }
        if let Some(search) = &filter.search {
            if !approval.prompt.to_lowercase().contains(&search.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

impl ApprovalStore for InMemoryApprovalStore {
    async fn insert(&self, approval: &Approval) -> Result<(), RepositoryError> {
        if self.approvals.contains_key(&approval.id) {
            return Err(RepositoryError::Conflict(format!(
                "approval {} already exists",
                approval.id
            )));
        }
        self.approvals.insert(approval.id, approval.clone());
        Ok(())
    }

    async fn update(&self, approval: &Approval) -> Result<(), RepositoryError> {
        if !self.approvals.contains_key(&approval.id) {
            return Err(RepositoryError::NotFound);
        }
        self.approvals.insert(approval.id, approval.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Approval>, RepositoryError> {
        Ok(self.approvals.get(id).map(|a| a.clone()))
    }

    async fn find_for_step(
        &self,
        thread_id: &str,
        step_id: &str,
    ) -> Result<Option<Approval>, RepositoryError> {
        let mut matching: Vec<Approval> = self
            .approvals
            .iter()
            .filter(|a| a.thread_id == thread_id && a.step_id == step_id)
            .map(|a| a.clone())
            .collect();
        matching.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        Ok(matching.into_iter().next())
    }

    async fn list(
        &self,
        filter: &ApprovalFilter,
        page: u32,
        page_size: u32,
    ) -> Result<ApprovalPage, RepositoryError> {
        let mut matching: Vec<Approval> = self
            .approvals
            .iter()
            .filter(|a| Self::matches(filter, a))
            .map(|a| a.clone())
            .collect();
        matching.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));

        let total = matching.len() as u64;
        let start = (page.saturating_sub(1) as usize) * page_size as usize;
        let items = matching.into_iter().skip(start).take(page_size as usize).collect();

        Ok(ApprovalPage { items, total, page, page_size })
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, RepositoryError> {
        Ok(self
            .approvals
            .iter()
            .filter(|a| {
                a.status == ApprovalStatus::Pending
                    && a.expires_at.is_some_and(|exp| exp <= now)
            })
            .map(|a| a.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
