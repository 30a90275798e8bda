//! Workflow state store trait definition.
//!
//! The checkpoint store: one durable document per `threadId`. `save` must be
//! an atomic replace (write-temp-then-rename or transactional row replace) so
//! that a crash between mutation and save leaves the pre-mutation state
//! intact and the executor can re-run idempotently.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use studio_types::error::RepositoryError;
use studio_types::workflow::{ThreadStatus, ThreadSummary, WorkflowState};

/// Filter for listing persisted threads.
#[derive(Debug, Clone, Default)]
pub struct ThreadFilter {
    pub project_id: Option<String>,
    pub status: Option<ThreadStatus>,
}

/// Repository trait for durable workflow thread state.
pub trait WorkflowStateStore: Send + Sync {
    /// Atomically replace the persisted state for `state.thread_id`.
    fn save(
        &self,
        state: &WorkflowState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load a thread's state, if it exists.
    fn load(
        &self,
        thread_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowState>, RepositoryError>> + Send;

    /// List thread summaries matching the filter, newest first.
    fn list(
        &self,
        filter: &ThreadFilter,
    ) -> impl std::future::Future<Output = Result<Vec<ThreadSummary>, RepositoryError>> + Send;

    /// Delete a thread's state. Returns `true` if it existed.
    fn delete(
        &self,
        thread_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
