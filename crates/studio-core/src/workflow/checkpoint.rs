//! Durable checkpoint manager for workflow thread state.
//!
//! Wraps `WorkflowStateStore` to provide the save-before-announce contract:
//! every status transition is persisted before the change is published on the
//! event bus, so a crash between mutation and save leaves the store at the
//! pre-mutation state and a resume re-runs idempotently.

use std::sync::Arc;

use chrono::Utc;
use studio_types::workflow::WorkflowState;
use thiserror::Error;

use crate::repository::workflow::WorkflowStateStore;

/// Manages durable checkpoints for workflow threads.
///
/// Generic over `S: WorkflowStateStore` so it works with any storage backend
/// (SQLite, in-memory, etc.). Holds the store behind `Arc` so the registry
/// and monitor can share the same instance.
pub struct CheckpointManager<S: WorkflowStateStore> {
    store: Arc<S>,
}

impl<S: WorkflowStateStore> CheckpointManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Persist the state, stamping `updated_at` and the heartbeat.
    pub async fn save(&self, state: &mut WorkflowState) -> Result<(), CheckpointError> {
        let now = Utc::now();
        state.updated_at = now;
        state.last_heartbeat = now;
        self.store
            .save(state)
            .await
            .map_err(|e| CheckpointError::Store(e.to_string()))?;
        tracing::debug!(
            thread_id = state.thread_id.as_str(),
            status = ?state.status,
            "checkpointed thread state"
        );
        Ok(())
    }

    /// Rehydrate a thread's state for resume.
    pub async fn load(&self, thread_id: &str) -> Result<WorkflowState, CheckpointError> {
        self.store
            .load(thread_id)
            .await
            .map_err(|e| CheckpointError::Store(e.to_string()))?
            .ok_or_else(|| CheckpointError::ThreadNotFound(thread_id.to_string()))
    }
}

/// Errors that can occur during checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("checkpoint store error: {0}")]
    Store(String),

    /// Thread not found (for restore operations).
    #[error("thread not found: {0}")]
    ThreadNotFound(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryStateStore;
    use studio_types::workflow::{StepStatus, WorkflowStep};

    #[tokio::test]
    async fn save_then_load_roundtrips_state() {
        let manager = CheckpointManager::new(Arc::new(InMemoryStateStore::new()));
        let mut state = WorkflowState::new(
            "t-1".to_string(),
            None,
            vec![WorkflowStep::task("a", "dev", "x", &[])],
        );
        state.step_outputs.insert("a".to_string(), "ok".to_string());
        state.step_status.insert("a".to_string(), StepStatus::Success);

        let before = state.updated_at;
        manager.save(&mut state).await.unwrap();
        assert!(state.updated_at >= before);

        let loaded = manager.load("t-1").await.unwrap();
        assert_eq!(loaded.step_outputs["a"], "ok");
        assert_eq!(loaded.status_of("a"), StepStatus::Success);
    }

    #[tokio::test]
    async fn load_missing_thread_errors() {
        let manager = CheckpointManager::new(Arc::new(InMemoryStateStore::new()));
        assert!(matches!(
            manager.load("ghost").await,
            Err(CheckpointError::ThreadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn save_bumps_heartbeat() {
        let manager = CheckpointManager::new(Arc::new(InMemoryStateStore::new()));
        let mut state = WorkflowState::new(
            "t-2".to_string(),
            None,
            vec![WorkflowStep::task("a", "dev", "x", &[])],
        );
        let old_heartbeat = state.last_heartbeat;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.save(&mut state).await.unwrap();
        assert!(state.last_heartbeat > old_heartbeat);
    }
}
