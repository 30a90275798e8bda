//! Approval store trait definition.

use chrono::{DateTime, Utc};
use studio_types::approval::{Approval, ApprovalFilter, ApprovalPage};
use studio_types::error::RepositoryError;
use uuid::Uuid;

/// Repository trait for approval records (the `workflow_approvals` table).
pub trait ApprovalStore: Send + Sync {
    /// Insert a new approval record.
    fn insert(
        &self,
        approval: &Approval,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace an existing approval record by id.
    fn update(
        &self,
        approval: &Approval,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Fetch an approval by id.
    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Approval>, RepositoryError>> + Send;

    /// Find the most recent approval for a `(threadId, stepId)` pair.
    fn find_for_step(
        &self,
        thread_id: &str,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Approval>, RepositoryError>> + Send;

    /// List approvals matching the filter, newest first, paginated.
    fn list(
        &self,
        filter: &ApprovalFilter,
        page: u32,
        page_size: u32,
    ) -> impl std::future::Future<Output = Result<ApprovalPage, RepositoryError>> + Send;

    /// All pending approvals whose `expires_at` is at or before `now`.
    fn list_expired(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Approval>, RepositoryError>> + Send;
}
