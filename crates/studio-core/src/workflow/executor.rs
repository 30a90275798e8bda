//! Workflow executor: ready-frontier scheduling with durable checkpointing.
//!
//! Drives a single thread's DAG to a settled state. Each round computes the
//! ready set (pending steps whose deps are all `success`/`skipped`), launches
//! ready steps concurrently up to `maxConcurrency`, awaits at least one
//! completion, folds the result into the thread state, persists the
//! checkpoint, and emits progress events. A step whose dependency `failed`
//! or was `blocked` propagates to `blocked`; a non-chosen conditional branch
//! and its transitive descendants are `skipped`.
//!
//! All writes to a thread's `WorkflowState` happen inside this loop, so
//! step-status transitions are serialized per thread. Checkpoints are
//! persisted before the corresponding event is announced.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use studio_types::agent::AgentConfig;
use studio_types::config::EngineConfig;
use studio_types::event::WorkflowEvent;
use studio_types::workflow::{
    StepOutcome, StepResult, StepStatus, ThreadStatus, WorkflowState, WorkflowStep,
};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowStateStore;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::step_runner::{ExecutorRegistry, StepContext, StepError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that abort the scheduling loop itself. Step failures do not -- they
/// fold into step statuses.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("executor error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Per-thread DAG scheduler.
///
/// Generic over `S: WorkflowStateStore` for storage flexibility. One
/// executor instance is shared across threads; per-thread mutable state
/// lives in the `WorkflowState` passed to [`WorkflowExecutor::run`].
pub struct WorkflowExecutor<S: WorkflowStateStore> {
    checkpoint: Arc<CheckpointManager<S>>,
    registry: Arc<ExecutorRegistry>,
    events: EventBus,
    config: EngineConfig,
}

impl<S: WorkflowStateStore + 'static> WorkflowExecutor<S> {
    pub fn new(
        checkpoint: Arc<CheckpointManager<S>>,
        registry: Arc<ExecutorRegistry>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self { checkpoint, registry, events, config }
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointManager<S>> {
        &self.checkpoint
    }

    /// Drive the thread until it settles or suspends.
    ///
    /// `agents` maps step ids to their resolved agent configurations;
    /// `resumed` marks re-invocations of an existing thread.
    pub async fn run(
        &self,
        state: &mut WorkflowState,
        agents: Arc<HashMap<String, AgentConfig>>,
        cancel: CancellationToken,
        resumed: bool,
    ) -> Result<ThreadStatus, ExecutorError> {
        let run_start = std::time::Instant::now();
        let definition = Arc::new(state.definition.clone());
        let sub_steps = sub_step_ids(&definition);

        // Steps left `running` by a crash never completed; re-run them.
        for status in state.step_status.values_mut() {
            if *status == StepStatus::Running {
                *status = StepStatus::Pending;
            }
        }

        state.status = ThreadStatus::Running;
        self.checkpoint.save(state).await?;
        self.events.publish(WorkflowEvent::WorkflowStarted {
            thread_id: state.thread_id.clone(),
            project_id: state.project_id.clone(),
            resumed,
        });

        tracing::info!(
            thread_id = state.thread_id.as_str(),
            steps = definition.len(),
            resumed,
            "executing workflow thread"
        );

        let mut in_flight: JoinSet<(String, Result<StepResult, StepError>)> = JoinSet::new();
        let mut suspended = false;

        let final_status = loop {
            if cancel.is_cancelled() {
                break self.drain_aborted(state, &mut in_flight).await?;
            }

            self.propagate_blocked(state, &definition, &sub_steps);

            // Ready: pending (or resumable awaiting-approval) top-level steps
            // whose deps are all satisfied.
            let ready: Vec<WorkflowStep> = definition
                .iter()
                .filter(|step| !sub_steps.contains(step.id.as_str()))
                .filter(|step| {
                    matches!(
                        state.status_of(&step.id),
                        StepStatus::Pending | StepStatus::AwaitingApproval
                    )
                })
                .filter(|step| {
                    step.deps.iter().all(|dep| state.status_of(dep).is_satisfied())
                })
                .cloned()
                .collect();

            let capacity = self.config.max_concurrency.saturating_sub(in_flight.len());
            let launching: Vec<WorkflowStep> = ready.into_iter().take(capacity).collect();

            if !launching.is_empty() {
                for step in &launching {
                    state.step_status.insert(step.id.clone(), StepStatus::Running);
                }
                self.checkpoint.save(state).await?;

                for step in launching {
                    self.events.publish(WorkflowEvent::StepStarted {
                        thread_id: state.thread_id.clone(),
                        step_id: step.id.clone(),
                        step_type: format!("{:?}", step.step_type).to_lowercase(),
                    });

                    let ctx = StepContext {
                        thread_id: state.thread_id.clone(),
                        project_id: state.project_id.clone(),
                        outputs: state.step_outputs.clone(),
                        statuses: state.step_status.clone(),
                        sessions: state.session_ids.clone(),
                        agents: Arc::clone(&agents),
                        definition: Arc::clone(&definition),
                        cancel: cancel.clone(),
                    };
                    let registry = Arc::clone(&self.registry);
                    in_flight.spawn(async move {
                        let result = registry.dispatch(&step, &ctx).await;
                        (step.id, result)
                    });
                }
            }

            if in_flight.is_empty() {
                // Nothing running and nothing launchable: any step still
                // pending is unreachable and reported as blocked.
                let mut stranded = false;
                for step in definition.iter() {
                    if sub_steps.contains(step.id.as_str()) {
                        continue;
                    }
                    if state.status_of(&step.id) == StepStatus::Pending {
                        state.step_status.insert(step.id.clone(), StepStatus::Blocked);
                        stranded = true;
                    }
                }
                if stranded {
                    self.checkpoint.save(state).await?;
                }
                break self.settle(state, &sub_steps);
            }

            let Some(joined) = in_flight.join_next().await else {
                break self.settle(state, &sub_steps);
            };
            let (step_id, result) = joined
                .map_err(|e| ExecutorError::Internal(format!("step task join error: {e}")))?;

            match result {
                Ok(result) => {
                    if matches!(result.outcome, StepOutcome::Suspended { .. }) {
                        self.fold_result(state, &step_id, result).await?;
                        suspended = true;
                        // Let in-flight siblings finish before suspending.
                        while let Some(joined) = in_flight.join_next().await {
                            let (sibling_id, sibling) = joined.map_err(|e| {
                                ExecutorError::Internal(format!("step task join error: {e}"))
                            })?;
                            match sibling {
                                Ok(result) => self.fold_result(state, &sibling_id, result).await?,
                                Err(e) => self.fold_error(state, &sibling_id, e).await?,
                            }
                        }
                        break ThreadStatus::Suspended;
                    }
                    self.fold_result(state, &step_id, result).await?;
                }
                Err(StepError::Cancelled { partial_response }) => {
                    if !partial_response.is_empty() {
                        state.step_outputs.insert(step_id.clone(), partial_response);
                    }
                    state.step_status.insert(step_id, StepStatus::Pending);
                    break self.drain_aborted(state, &mut in_flight).await?;
                }
                Err(e) => {
                    self.fold_error(state, &step_id, e).await?;
                }
            }
        };

        state.status = final_status;
        self.checkpoint.save(state).await?;

        match final_status {
            ThreadStatus::Aborted => {
                self.events.publish(WorkflowEvent::WorkflowAborted {
                    thread_id: state.thread_id.clone(),
                });
            }
            ThreadStatus::Suspended => {
                // workflow:suspended was emitted when the gate opened.
                debug_assert!(suspended);
            }
            status => {
                self.events.publish(WorkflowEvent::WorkflowCompleted {
                    thread_id: state.thread_id.clone(),
                    status,
                    duration_ms: run_start.elapsed().as_millis() as u64,
                });
            }
        }

        tracing::info!(
            thread_id = state.thread_id.as_str(),
            status = ?final_status,
            "workflow thread settled"
        );

        Ok(final_status)
    }

    /// Fold a successful step dispatch into the thread state, persist, emit.
    async fn fold_result(
        &self,
        state: &mut WorkflowState,
        step_id: &str,
        result: StepResult,
    ) -> Result<(), ExecutorError> {
        state.step_status.insert(step_id.to_string(), result.status);
        state.step_outputs.insert(step_id.to_string(), result.response);
        if let Some(session) = result.session_id {
            state.session_ids.insert(step_id.to_string(), session);
        }
        if let Some(error) = &result.error {
            state.step_errors.insert(step_id.to_string(), error.clone());
        } else {
            state.step_errors.remove(step_id);
        }

        match &result.outcome {
            StepOutcome::Branch { skipped, .. } => {
                for id in skipped {
                    if matches!(
                        state.status_of(id),
                        StepStatus::Pending | StepStatus::AwaitingApproval
                    ) {
                        state.step_status.insert(id.clone(), StepStatus::Skipped);
                    }
                }
            }
            StepOutcome::Parallel { child_outputs, child_statuses, child_sessions } => {
                state.step_outputs.extend(child_outputs.clone());
                state.step_status.extend(child_statuses.clone());
                state.session_ids.extend(child_sessions.clone());
            }
            StepOutcome::Loop {
                iterations,
                child_outputs,
                child_statuses,
                child_sessions,
                ..
            } => {
                state.current_iteration.insert(step_id.to_string(), *iterations);
                state.step_outputs.extend(child_outputs.clone());
                state.step_status.extend(child_statuses.clone());
                state.session_ids.extend(child_sessions.clone());
            }
            StepOutcome::Suspended { approval_id } => {
                state.approval_ids.insert(step_id.to_string(), approval_id.clone());
                state.status = ThreadStatus::Suspended;
            }
            StepOutcome::Task { .. } => {}
        }

        self.checkpoint.save(state).await?;

        match &result.outcome {
            StepOutcome::Suspended { approval_id } => {
                self.events.publish(WorkflowEvent::WorkflowSuspended {
                    thread_id: state.thread_id.clone(),
                    step_id: step_id.to_string(),
                    approval_id: approval_id.parse().unwrap_or_default(),
                });
            }
            _ if result.status == StepStatus::Success => {
                self.events.publish(WorkflowEvent::StepCompleted {
                    thread_id: state.thread_id.clone(),
                    step_id: step_id.to_string(),
                    status: result.status,
                    duration_ms: result.duration_ms,
                });
            }
            _ => {
                self.events.publish(WorkflowEvent::StepFailed {
                    thread_id: state.thread_id.clone(),
                    step_id: step_id.to_string(),
                    error: result.error.unwrap_or_else(|| "step failed".to_string()),
                });
            }
        }

        Ok(())
    }

    /// Fold a step dispatch error as a failed step.
    async fn fold_error(
        &self,
        state: &mut WorkflowState,
        step_id: &str,
        error: StepError,
    ) -> Result<(), ExecutorError> {
        let message = error.to_string();
        tracing::warn!(
            thread_id = state.thread_id.as_str(),
            step_id,
            error = message.as_str(),
            "step failed"
        );
        state.step_status.insert(step_id.to_string(), StepStatus::Failed);
        state.step_errors.insert(step_id.to_string(), message.clone());
        self.checkpoint.save(state).await?;
        self.events.publish(WorkflowEvent::StepFailed {
            thread_id: state.thread_id.clone(),
            step_id: step_id.to_string(),
            error: message,
        });
        Ok(())
    }

    /// Mark pending steps whose dependency failed or was blocked.
    fn propagate_blocked(
        &self,
        state: &mut WorkflowState,
        definition: &[WorkflowStep],
        sub_steps: &HashSet<String>,
    ) {
        // Fixpoint: blocking can cascade through chains of dependents.
        loop {
            let mut changed = false;
            for step in definition {
                if sub_steps.contains(step.id.as_str()) {
                    continue;
                }
                if state.status_of(&step.id) != StepStatus::Pending {
                    continue;
                }
                let blocked_dep = step.deps.iter().any(|dep| {
                    matches!(state.status_of(dep), StepStatus::Failed | StepStatus::Blocked)
                });
                if blocked_dep {
                    state.step_status.insert(step.id.clone(), StepStatus::Blocked);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Cancel in-flight steps, preserve partial output, and finish aborted.
    async fn drain_aborted(
        &self,
        state: &mut WorkflowState,
        in_flight: &mut JoinSet<(String, Result<StepResult, StepError>)>,
    ) -> Result<ThreadStatus, ExecutorError> {
        while let Some(joined) = in_flight.join_next().await {
            let Ok((step_id, result)) = joined else { continue };
            match result {
                Ok(result) => self.fold_result(state, &step_id, result).await?,
                Err(StepError::Cancelled { partial_response }) => {
                    if !partial_response.is_empty() {
                        state.step_outputs.insert(step_id.clone(), partial_response);
                    }
                    state.step_status.insert(step_id, StepStatus::Pending);
                }
                Err(e) => self.fold_error(state, &step_id, e).await?,
            }
        }
        Ok(ThreadStatus::Aborted)
    }

    /// Compute the settled status once no step is running or launchable.
    fn settle(&self, state: &mut WorkflowState, sub_steps: &HashSet<String>) -> ThreadStatus {
        // Sub-steps their parent never ran are skipped, so every step ends
        // in a terminal status.
        for id in sub_steps {
            if state.status_of(id) == StepStatus::Pending {
                state.step_status.insert(id.clone(), StepStatus::Skipped);
            }
        }

        let mut successes = 0usize;
        let mut failures = 0usize;
        let mut blocked = 0usize;
        for status in state.step_status.values() {
            match status {
                StepStatus::Success => successes += 1,
                StepStatus::Failed => failures += 1,
                StepStatus::Blocked => blocked += 1,
                _ => {}
            }
        }

        if failures == 0 && blocked == 0 {
            ThreadStatus::Completed
        } else if successes == 0 {
            ThreadStatus::Failed
        } else {
            ThreadStatus::Partial
        }
    }
}

/// Ids of steps owned by a parallel or loop parent; excluded from top-level
/// scheduling.
pub fn sub_step_ids(definition: &[WorkflowStep]) -> HashSet<String> {
    let mut ids = HashSet::new();
    for step in definition {
        for id in step.parallel_steps.iter().chain(step.loop_steps.iter()) {
            ids.insert(id.clone());
        }
    }
    ids
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
