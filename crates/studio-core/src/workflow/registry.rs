//! Workflow registry: index of live and historical threads.
//!
//! Tracks which threads have an active worker in this process (with their
//! abort tokens), lists persisted thread summaries, and projects a thread's
//! state into a graph for visualization.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use studio_types::workflow::{StepStatus, ThreadStatus, ThreadSummary, WorkflowState};
use tokio_util::sync::CancellationToken;

use crate::repository::workflow::{ThreadFilter, WorkflowStateStore};

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Graph projection types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    pub status: StepStatus,
    /// First line of the task text, for display.
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    /// `dep`, `branch-true`, `branch-false`, `parallel`, or `loop`.
    pub kind: String,
}

/// Where execution has been and where it can pick up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTrace {
    /// Steps that reached `success`, in definition order.
    pub path: Vec<String>,
    /// Step currently running or awaiting approval, if any.
    pub current_node: Option<String>,
    /// Loop step id -> iterations completed.
    pub loops: HashMap<String, u32>,
    /// Pending steps whose dependencies are already satisfied.
    pub resume_points: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetadata {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub blocked_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGraph {
    pub thread_id: String,
    pub status: ThreadStatus,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub execution: ExecutionTrace,
    pub metadata: GraphMetadata,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A live thread's handle in this process.
#[derive(Debug, Clone)]
pub struct ThreadHandle {
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
}

/// Index of live and historical workflow threads.
pub struct WorkflowRegistry<S: WorkflowStateStore> {
    store: std::sync::Arc<S>,
    active: DashMap<String, ThreadHandle>,
}

impl<S: WorkflowStateStore> WorkflowRegistry<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store, active: DashMap::new() }
    }

    /// Register a live worker for a thread, returning its abort token.
    pub fn register(&self, thread_id: &str) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.active.insert(
            thread_id.to_string(),
            ThreadHandle { cancel: cancel.clone(), started_at: Utc::now() },
        );
        cancel
    }

    /// Drop the live handle once the worker settles.
    pub fn deregister(&self, thread_id: &str) {
        self.active.remove(thread_id);
    }

    /// Whether a worker for this thread is live in this process.
    pub fn is_active(&self, thread_id: &str) -> bool {
        self.active.contains_key(thread_id)
    }

    /// Signal abort for a live thread. Returns `false` when no worker is live.
    pub fn abort(&self, thread_id: &str) -> bool {
        match self.active.get(thread_id) {
            Some(handle) => {
                handle.cancel.cancel();
                tracing::info!(thread_id, "abort requested");
                true
            }
            None => false,
        }
    }

    /// List persisted thread summaries.
    pub async fn list(&self, filter: &ThreadFilter) -> Result<Vec<ThreadSummary>, WorkflowError> {
        self.store
            .list(filter)
            .await
            .map_err(|e| WorkflowError::ExecutionError(e.to_string()))
    }

    /// Load a thread's full state.
    pub async fn get(&self, thread_id: &str) -> Result<Option<WorkflowState>, WorkflowError> {
        self.store
            .load(thread_id)
            .await
            .map_err(|e| WorkflowError::ExecutionError(e.to_string()))
    }

    /// Delete a thread: aborts any live worker, then cascades to the store.
    pub async fn delete(&self, thread_id: &str) -> Result<bool, WorkflowError> {
        self.abort(thread_id);
        self.deregister(thread_id);
        self.store
            .delete(thread_id)
            .await
            .map_err(|e| WorkflowError::ExecutionError(e.to_string()))
    }

    /// Project a thread's state into a visualization graph.
    pub async fn graph(&self, thread_id: &str) -> Result<WorkflowGraph, WorkflowError> {
        let state = self
            .get(thread_id)
            .await?
            .ok_or_else(|| WorkflowError::UnknownThread(thread_id.to_string()))?;
        Ok(build_graph(&state))
    }
}

/// Build the graph projection from a state snapshot.
pub fn build_graph(state: &WorkflowState) -> WorkflowGraph {
    let nodes: Vec<GraphNode> = state
        .definition
        .iter()
        .map(|step| GraphNode {
            id: step.id.clone(),
            step_type: format!("{:?}", step.step_type).to_lowercase(),
            status: state.status_of(&step.id),
            label: step
                .task
                .lines()
                .next()
                .unwrap_or_default()
                .chars()
                .take(80)
                .collect(),
        })
        .collect();

    let mut edges = Vec::new();
    for step in &state.definition {
        for dep in &step.deps {
            edges.push(GraphEdge {
                from: dep.clone(),
                to: step.id.clone(),
                kind: "dep".to_string(),
            });
        }
        if let Some(branch) = &step.true_branch {
            edges.push(GraphEdge {
                from: step.id.clone(),
                to: branch.clone(),
                kind: "branch-true".to_string(),
            });
        }
        if let Some(branch) = &step.false_branch {
            edges.push(GraphEdge {
                from: step.id.clone(),
                to: branch.clone(),
                kind: "branch-false".to_string(),
            });
        }
        for child in &step.parallel_steps {
            edges.push(GraphEdge {
                from: step.id.clone(),
                to: child.clone(),
                kind: "parallel".to_string(),
            });
        }
        for child in &step.loop_steps {
            edges.push(GraphEdge {
                from: step.id.clone(),
                to: child.clone(),
                kind: "loop".to_string(),
            });
        }
    }

    let path: Vec<String> = state
        .definition
        .iter()
        .filter(|s| state.status_of(&s.id) == StepStatus::Success)
        .map(|s| s.id.clone())
        .collect();

    let current_node = state
        .definition
        .iter()
        .find(|s| {
            matches!(
                state.status_of(&s.id),
                StepStatus::Running | StepStatus::AwaitingApproval
            )
        })
        .map(|s| s.id.clone());

    let resume_points: Vec<String> = state
        .definition
        .iter()
        .filter(|s| state.status_of(&s.id) == StepStatus::Pending)
        .filter(|s| s.deps.iter().all(|d| state.status_of(d).is_satisfied()))
        .map(|s| s.id.clone())
        .collect();

    let completed = state
        .step_status
        .values()
        .filter(|s| **s == StepStatus::Success)
        .count();
    let failed = state
        .step_status
        .values()
        .filter(|s| **s == StepStatus::Failed)
        .count();
    let blocked = state
        .step_status
        .values()
        .filter(|s| **s == StepStatus::Blocked)
        .count();

    WorkflowGraph {
        thread_id: state.thread_id.clone(),
        status: state.status,
        nodes,
        edges,
        execution: ExecutionTrace {
            path,
            current_node,
            loops: state.current_iteration.clone(),
            resume_points,
        },
        metadata: GraphMetadata {
            total_steps: state.definition.len(),
            completed_steps: completed,
            failed_steps: failed,
            blocked_steps: blocked,
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryStateStore;
    use std::sync::Arc;
    use studio_types::workflow::{StepType, WorkflowStep};

    fn registry() -> WorkflowRegistry<InMemoryStateStore> {
        WorkflowRegistry::new(Arc::new(InMemoryStateStore::new()))
    }

    fn sample_state() -> WorkflowState {
        let mut cond = WorkflowStep::task("cond", "dev", "", &["a"]);
        cond.step_type = StepType::Conditional;
        cond.role = None;
        cond.true_branch = Some("b".to_string());
        cond.false_branch = Some("c".to_string());

        let steps = vec![
            WorkflowStep::task("a", "dev", "first line\nsecond line", &[]),
            cond,
            WorkflowStep::task("b", "dev", "yes", &["cond"]),
            WorkflowStep::task("c", "dev", "no", &["cond"]),
        ];
        let mut state = WorkflowState::new("t-1".to_string(), Some("proj".to_string()), steps);
        state.step_status.insert("a".to_string(), StepStatus::Success);
        state.step_status.insert("cond".to_string(), StepStatus::Success);
        state.step_status.insert("b".to_string(), StepStatus::Running);
        state.step_status.insert("c".to_string(), StepStatus::Skipped);
        state
    }

    #[tokio::test]
    async fn register_abort_deregister_lifecycle() {
        let reg = registry();
        let token = reg.register("t-1");
        assert!(reg.is_active("t-1"));
        assert!(!token.is_cancelled());

        assert!(reg.abort("t-1"));
        assert!(token.is_cancelled());

        reg.deregister("t-1");
        assert!(!reg.is_active("t-1"));
        assert!(!reg.abort("t-1"));
    }

    #[tokio::test]
    async fn delete_cascades_to_store() {
        let reg = registry();
        let mut state = sample_state();
        reg.store.save(&state).await.unwrap();
        state.thread_id = "t-2".to_string();
        reg.store.save(&state).await.unwrap();

        assert!(reg.delete("t-1").await.unwrap());
        assert!(reg.get("t-1").await.unwrap().is_none());
        assert!(reg.get("t-2").await.unwrap().is_some());
        assert!(!reg.delete("t-1").await.unwrap());
    }

    #[tokio::test]
    async fn graph_projection_shape() {
        let reg = registry();
        reg.store.save(&sample_state()).await.unwrap();

        let graph = reg.graph("t-1").await.unwrap();
        assert_eq!(graph.thread_id, "t-1");
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.metadata.total_steps, 4);
        assert_eq!(graph.metadata.completed_steps, 2);

        let node_a = graph.nodes.iter().find(|n| n.id == "a").unwrap();
        assert_eq!(node_a.label, "first line");
        assert_eq!(node_a.status, StepStatus::Success);

        let kinds: Vec<&str> = graph.edges.iter().map(|e| e.kind.as_str()).collect();
        assert!(kinds.contains(&"dep"));
        assert!(kinds.contains(&"branch-true"));
        assert!(kinds.contains(&"branch-false"));

        assert_eq!(graph.execution.path, vec!["a", "cond"]);
        assert_eq!(graph.execution.current_node.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn graph_unknown_thread_errors() {
        let reg = registry();
        assert!(matches!(
            reg.graph("ghost").await,
            Err(WorkflowError::UnknownThread(_))
        ));
    }

    #[tokio::test]
    async fn resume_points_are_satisfied_pending_steps() {
        let reg = registry();
        let mut state = sample_state();
        // b back to pending with satisfied dep (cond succeeded).
        state.step_status.insert("b".to_string(), StepStatus::Pending);
        reg.store.save(&state).await.unwrap();

        let graph = reg.graph("t-1").await.unwrap();
        assert_eq!(graph.execution.resume_points, vec!["b"]);
    }
}
