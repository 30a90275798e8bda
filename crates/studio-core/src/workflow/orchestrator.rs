//! Workflow orchestrator: the engine's entry point.
//!
//! Validates invoke requests, resolves each step's agent binding, creates or
//! rehydrates the thread state, registers the worker with the registry, and
//! drives the executor. Also hosts the approval listener that resumes
//! suspended threads when their approvals resolve or expire.
//!
//! One worker per `threadId`: a second invoke while a worker is live is
//! rejected, which keeps all state writes for a thread serialized.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use studio_types::agent::AgentConfig;
use studio_types::event::WorkflowEvent;
use studio_types::workflow::{
    StepStatus, StepType, ThreadStatus, WorkflowState, WorkflowStep,
};
use uuid::Uuid;

use crate::agent::registry::AgentDirectory;
use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowStateStore;

use super::definition::{self, WorkflowError};
use super::executor::WorkflowExecutor;
use super::registry::WorkflowRegistry;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// A workflow invocation request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    /// The steps to execute. The HTTP layer accepts a single step or a list;
    /// both normalize to this vector.
    pub workflow: Vec<WorkflowStep>,
    #[serde(default)]
    pub project_id: Option<String>,
    /// Supplying an existing thread id resumes that thread.
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Drop stored LLM sessions so agents start fresh conversations.
    #[serde(default)]
    pub start_new_conversation: bool,
}

/// Per-step projection in the invoke response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepErrorBody {
    pub message: String,
}

/// The invoke response: thread snapshot plus a human-readable summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    pub thread_id: String,
    pub session_ids: HashMap<String, String>,
    pub results: HashMap<String, StepReport>,
    pub status: ThreadStatus,
    pub summary: String,
}

impl InvokeResponse {
    fn from_state(state: &WorkflowState) -> Self {
        let results: HashMap<String, StepReport> = state
            .definition
            .iter()
            .map(|step| {
                let status = state.status_of(&step.id);
                (
                    step.id.clone(),
                    StepReport {
                        status,
                        output: state.step_outputs.get(&step.id).cloned(),
                        error: state
                            .step_errors
                            .get(&step.id)
                            .map(|m| StepErrorBody { message: m.clone() }),
                    },
                )
            })
            .collect();

        Self {
            thread_id: state.thread_id.clone(),
            session_ids: state.session_ids.clone(),
            summary: summarize(state),
            status: state.status,
            results,
        }
    }
}

fn summarize(state: &WorkflowState) -> String {
    let total = state.definition.len();
    let count = |wanted: StepStatus| {
        state
            .definition
            .iter()
            .filter(|s| state.status_of(&s.id) == wanted)
            .count()
    };
    let succeeded = count(StepStatus::Success);
    let failed = count(StepStatus::Failed);
    let blocked = count(StepStatus::Blocked);
    let skipped = count(StepStatus::Skipped);
    let waiting = count(StepStatus::AwaitingApproval);

    let mut parts = vec![format!("{succeeded}/{total} steps succeeded")];
    if failed > 0 {
        parts.push(format!("{failed} failed"));
    }
    if blocked > 0 {
        parts.push(format!("{blocked} blocked"));
    }
    if skipped > 0 {
        parts.push(format!("{skipped} skipped"));
    }
    if waiting > 0 {
        parts.push(format!("{waiting} awaiting approval"));
    }
    parts.join(", ")
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The engine façade.
pub struct WorkflowOrchestrator<S, A>
where
    S: WorkflowStateStore + 'static,
    A: AgentDirectory + 'static,
{
    executor: Arc<WorkflowExecutor<S>>,
    registry: Arc<WorkflowRegistry<S>>,
    agents: Arc<A>,
    events: EventBus,
}

impl<S, A> WorkflowOrchestrator<S, A>
where
    S: WorkflowStateStore + 'static,
    A: AgentDirectory + 'static,
{
    pub fn new(
        executor: Arc<WorkflowExecutor<S>>,
        registry: Arc<WorkflowRegistry<S>>,
        agents: Arc<A>,
        events: EventBus,
    ) -> Self {
        Self { executor, registry, agents, events }
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry<S>> {
        &self.registry
    }

    /// Invoke a workflow: create a new thread, or resume `threadId` if its
    /// state loads.
    pub async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse, WorkflowError> {
        let (mut state, resumed) = match &request.thread_id {
            Some(thread_id) => match self
                .registry
                .get(thread_id)
                .await?
            {
                Some(existing) => (existing, true),
                None => (self.new_state(&request, Some(thread_id.clone()))?, false),
            },
            None => (self.new_state(&request, None)?, false),
        };

        if self.registry.is_active(&state.thread_id) {
            return Err(WorkflowError::ExecutionError(format!(
                "thread '{}' already has a live worker",
                state.thread_id
            )));
        }

        if request.start_new_conversation {
            state.session_ids.clear();
        }

        let agents = Arc::new(self.resolve_agents(&state.definition, state.project_id.as_deref()).await?);

        let cancel = self.registry.register(&state.thread_id);
        let run = self
            .executor
            .run(&mut state, agents, cancel, resumed)
            .await;
        self.registry.deregister(&state.thread_id);

        run.map_err(|e| WorkflowError::ExecutionError(e.to_string()))?;
        Ok(InvokeResponse::from_state(&state))
    }

    /// Resume an existing thread (monitor recovery, approval resolution).
    pub async fn resume(&self, thread_id: &str) -> Result<InvokeResponse, WorkflowError> {
        let state = self
            .registry
            .get(thread_id)
            .await?
            .ok_or_else(|| WorkflowError::UnknownThread(thread_id.to_string()))?;
        self.invoke(InvokeRequest {
            workflow: state.definition.clone(),
            project_id: state.project_id.clone(),
            thread_id: Some(thread_id.to_string()),
            start_new_conversation: false,
        })
        .await
    }

    /// Request an abort of a live thread.
    pub fn abort(&self, thread_id: &str) -> bool {
        self.registry.abort(thread_id)
    }

    /// Current state projection for the status endpoint.
    pub async fn status(&self, thread_id: &str) -> Result<InvokeResponse, WorkflowError> {
        let state = self
            .registry
            .get(thread_id)
            .await?
            .ok_or_else(|| WorkflowError::UnknownThread(thread_id.to_string()))?;
        Ok(InvokeResponse::from_state(&state))
    }

    fn new_state(
        &self,
        request: &InvokeRequest,
        thread_id: Option<String>,
    ) -> Result<WorkflowState, WorkflowError> {
        definition::validate_workflow(&request.workflow)?;
        let thread_id = thread_id.unwrap_or_else(|| Uuid::now_v7().to_string());
        Ok(WorkflowState::new(
            thread_id,
            request.project_id.clone(),
            request.workflow.clone(),
        ))
    }

    /// Resolve the agent binding for every task step.
    ///
    /// `agentId` resolves case-sensitively within the project's agent set;
    /// `role` resolves case-insensitively, project first, then global.
    async fn resolve_agents(
        &self,
        definition: &[WorkflowStep],
        project_id: Option<&str>,
    ) -> Result<HashMap<String, AgentConfig>, WorkflowError> {
        let mut resolved = HashMap::new();
        for step in definition {
            if step.step_type != StepType::Task {
                continue;
            }
            let config = if let Some(agent_id) = &step.agent_id {
                self.agents
                    .resolve_id(agent_id, project_id)
                    .await
                    .map_err(|e| WorkflowError::ExecutionError(e.to_string()))?
                    .ok_or_else(|| WorkflowError::AgentUnresolved {
                        step_id: step.id.clone(),
                        detail: format!("no agent with id '{agent_id}'"),
                    })?
            } else if let Some(role) = &step.role {
                self.agents
                    .resolve_role(role, project_id)
                    .await
                    .map_err(|e| WorkflowError::ExecutionError(e.to_string()))?
                    .ok_or_else(|| WorkflowError::AgentUnresolved {
                        step_id: step.id.clone(),
                        detail: format!("no agent for role '{role}'"),
                    })?
            } else {
                return Err(WorkflowError::AgentUnresolved {
                    step_id: step.id.clone(),
                    detail: "task step carries neither role nor agentId".to_string(),
                });
            };
            resolved.insert(step.id.clone(), config);
        }
        Ok(resolved)
    }

    /// Listen for approval resolutions and resume the suspended threads
    /// waiting on them.
    pub fn spawn_approval_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "approval listener lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                let thread_id = match &event {
                    WorkflowEvent::ApprovalResolved { thread_id, .. }
                    | WorkflowEvent::ApprovalExpired { thread_id, .. } => thread_id.clone(),
                    _ => continue,
                };

                // Resume in a task so one slow thread does not stall the
                // listener loop.
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    // The decision may land while the worker is still
                    // draining toward its suspension point; give it a
                    // bounded window to go inactive.
                    for _ in 0..40 {
                        if !orchestrator.registry.is_active(&thread_id) {
                            break;
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                    }
                    match orchestrator.registry.get(&thread_id).await {
                        Ok(Some(state)) if state.status == ThreadStatus::Suspended => {}
                        _ => return,
                    }

                    tracing::info!(
                        thread_id = thread_id.as_str(),
                        "approval resolved, resuming suspended thread"
                    );
                    if let Err(e) = orchestrator.resume(&thread_id).await {
                        tracing::warn!(
                            thread_id = thread_id.as_str(),
                            error = %e,
                            "failed to resume thread after approval"
                        );
                    }
                });
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
