//! Step executor registry and the six step executors.
//!
//! `StepExecutor` is the polymorphic capability set `{can_handle, execute}`;
//! `ExecutorRegistry` dispatches a step to the first executor claiming it.
//! Parallel and loop executors re-enter the registry for their child steps,
//! so the registry holds a weak self-reference.
//!
//! Executors receive an immutable `StepContext` snapshot and return a
//! `StepResult`; folding results back into the thread state is the workflow
//! executor's job -- step executors never touch the store.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use studio_types::agent::AgentConfig;
use studio_types::approval::{ApprovalStatus, CreateApprovalRequest, RiskLevel};
use studio_types::config::EngineConfig;
use studio_types::event::WorkflowEvent;
use studio_types::llm::{LlmError, StreamEvent};
use studio_types::workflow::{
    LoopType, StepOutcome, StepResult, StepStatus, StepType, TimeoutBehavior, WorkflowStep,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::approval::service::{ApprovalError, ApprovalGate};
use crate::event::bus::EventBus;
use crate::llm::session::{AgentInvocation, SessionLlm};

use super::condition;
use super::dag;
use super::operator::{OperatorInput, ResponseOperator};
use super::template::{self, TemplateContext};

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Immutable snapshot handed to a step executor.
#[derive(Clone)]
pub struct StepContext {
    pub thread_id: String,
    pub project_id: Option<String>,
    /// Outputs of steps completed so far.
    pub outputs: HashMap<String, String>,
    pub statuses: HashMap<String, StepStatus>,
    /// Session ids recorded per step (for resume continuity).
    pub sessions: HashMap<String, String>,
    /// Agents resolved per step id by the orchestrator.
    pub agents: Arc<HashMap<String, AgentConfig>>,
    /// The full step definition list (for child dispatch).
    pub definition: Arc<Vec<WorkflowStep>>,
    pub cancel: CancellationToken,
}

impl StepContext {
    fn template_ctx(&self) -> TemplateContext {
        TemplateContext {
            thread_id: self.thread_id.clone(),
            project_id: self.project_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Resolve template variables against this snapshot.
    pub fn resolve(&self, text: &str) -> String {
        template::resolve(text, &self.outputs, &self.statuses, &self.template_ctx())
    }

    fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.definition.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors that can occur during step execution.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("step execution failed: {0}")]
    ExecutionFailed(String),

    #[error("no agent resolved: {0}")]
    AgentUnresolved(String),

    #[error("condition error: {0}")]
    Condition(String),

    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    #[error("approval error: {0}")]
    Approval(#[from] ApprovalError),

    /// Abort signal observed mid-step; partial output is preserved.
    #[error("step cancelled")]
    Cancelled { partial_response: String },
}

// ---------------------------------------------------------------------------
// StepExecutor trait + registry
// ---------------------------------------------------------------------------

/// Capability set for a step executor.
pub trait StepExecutor: Send + Sync {
    fn can_handle(&self, step: &WorkflowStep) -> bool;

    fn execute<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<StepResult, StepError>>;
}

/// Ordered collection of executors; dispatch picks the first match.
pub struct ExecutorRegistry {
    executors: Vec<Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    /// Build the standard registry wiring the six executors to their
    /// collaborators.
    pub fn standard(
        llm: Arc<SessionLlm>,
        operator: Arc<dyn ResponseOperator>,
        approvals: Arc<dyn ApprovalGate>,
        events: EventBus,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ExecutorRegistry>| Self {
            executors: vec![
                Arc::new(ClaudeExecutor {
                    llm,
                    operator,
                    events,
                    default_timeout_secs: config.step_timeout_secs,
                }),
                Arc::new(MockExecutor),
                Arc::new(ConditionalExecutor),
                Arc::new(ParallelExecutor { registry: weak.clone() }),
                Arc::new(LoopExecutor { registry: weak.clone() }),
                Arc::new(HumanExecutor { approvals }),
            ],
        })
    }

    /// Registry with a custom executor list (tests, embedders).
    pub fn with_executors(executors: Vec<Arc<dyn StepExecutor>>) -> Arc<Self> {
        Arc::new(Self { executors })
    }

    /// Dispatch a step to the first executor that claims it.
    pub async fn dispatch(
        &self,
        step: &WorkflowStep,
        ctx: &StepContext,
    ) -> Result<StepResult, StepError> {
        let executor = self
            .executors
            .iter()
            .find(|e| e.can_handle(step))
            .ok_or_else(|| {
                StepError::ExecutionFailed(format!(
                    "no executor for step '{}' of type {:?}",
                    step.id, step.step_type
                ))
            })?;
        executor.execute(step, ctx).await
    }
}

// ---------------------------------------------------------------------------
// Claude executor
// ---------------------------------------------------------------------------

/// Runs a task step against the LLM and classifies the response.
pub struct ClaudeExecutor {
    llm: Arc<SessionLlm>,
    operator: Arc<dyn ResponseOperator>,
    events: EventBus,
    default_timeout_secs: u64,
}

impl StepExecutor for ClaudeExecutor {
    fn can_handle(&self, step: &WorkflowStep) -> bool {
        step.step_type == StepType::Task
    }

    fn execute<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<StepResult, StepError>> {
        Box::pin(async move {
            let start = std::time::Instant::now();

            let agent = ctx.agents.get(&step.id).ok_or_else(|| {
                StepError::AgentUnresolved(format!("step '{}' has no resolved agent", step.id))
            })?;

            let task = ctx.resolve(&step.task);
            let (session_id, mut stream) = self.llm.invoke(AgentInvocation {
                system_prompt: agent.system_prompt.clone(),
                user_prompt: task.clone(),
                session_id: ctx.sessions.get(&step.id).cloned(),
                model: agent.model.clone(),
                max_tokens: agent.max_tokens,
                temperature: agent.temperature,
            });

            let timeout_secs = step.timeout_seconds.unwrap_or(self.default_timeout_secs);
            let mut text = String::new();

            let collected: Result<(), StepError> = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                async {
                    loop {
                        tokio::select! {
                            biased;
                            _ = ctx.cancel.cancelled() => {
                                return Err(StepError::Cancelled {
                                    partial_response: std::mem::take(&mut text),
                                });
                            }
                            event = stream.next() => {
                                match event {
                                    Some(Ok(StreamEvent::TextDelta { text: delta })) => {
                                        self.events.publish(WorkflowEvent::AgentToken {
                                            thread_id: ctx.thread_id.clone(),
                                            step_id: step.id.clone(),
                                            text: delta.clone(),
                                        });
                                        text.push_str(&delta);
                                    }
                                    Some(Ok(StreamEvent::ToolUse { name, .. })) => {
                                        self.events.publish(WorkflowEvent::AgentToolInvoked {
                                            thread_id: ctx.thread_id.clone(),
                                            step_id: step.id.clone(),
                                            tool: name,
                                        });
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => return Err(StepError::Llm(e)),
                                    None => return Ok(()),
                                }
                            }
                        }
                    }
                },
            )
            .await
            .unwrap_or(Err(StepError::Llm(LlmError::Timeout(timeout_secs))));
            collected?;

            self.llm.record_response(&session_id, &text);

            let verdict = self
                .operator
                .classify(OperatorInput { response: &text, role: agent.role.as_str(), task: &task })
                .await;

            let status = verdict.verdict.as_step_status();
            let error = match status {
                StepStatus::Success => None,
                _ => Some(verdict.reason.clone()),
            };

            tracing::debug!(
                thread_id = ctx.thread_id.as_str(),
                step_id = step.id.as_str(),
                verdict = ?verdict.verdict,
                chars = text.len(),
                "task step finished"
            );

            Ok(StepResult {
                status,
                response: text,
                session_id: Some(session_id),
                error,
                duration_ms: start.elapsed().as_millis() as u64,
                outcome: StepOutcome::Task { verdict: Some(verdict) },
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Mock executor
// ---------------------------------------------------------------------------

/// Deterministic executor for tests: pattern-matched canned responses with an
/// optional artificial delay (`config.mockDelay`, milliseconds).
pub struct MockExecutor;

impl MockExecutor {
    fn canned_response(step: &WorkflowStep, resolved_task: &str) -> Option<String> {
        if let Some(entries) = step.config.get("mockResponses").and_then(|v| v.as_array()) {
            for entry in entries {
                let pattern = entry.get("pattern").and_then(|v| v.as_str()).unwrap_or_default();
                if !pattern.is_empty() && resolved_task.contains(pattern) {
                    return entry.get("response").and_then(|v| v.as_str()).map(String::from);
                }
            }
        }
        step.config
            .get("mockResponse")
            .and_then(|v| v.as_str())
            .map(String::from)
    }
}

impl StepExecutor for MockExecutor {
    fn can_handle(&self, step: &WorkflowStep) -> bool {
        step.step_type == StepType::Mock
    }

    fn execute<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<StepResult, StepError>> {
        Box::pin(async move {
            let start = std::time::Instant::now();

            if let Some(delay_ms) = step.config.get("mockDelay").and_then(|v| v.as_u64()) {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {
                        return Err(StepError::Cancelled { partial_response: String::new() });
                    }
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                }
            }

            let resolved_task = ctx.resolve(&step.task);
            let response = match Self::canned_response(step, &resolved_task) {
                Some(canned) => ctx.resolve(&canned),
                None => resolved_task,
            };

            Ok(StepResult {
                status: StepStatus::Success,
                response,
                session_id: None,
                error: None,
                duration_ms: start.elapsed().as_millis() as u64,
                outcome: StepOutcome::Task { verdict: None },
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Conditional executor
// ---------------------------------------------------------------------------

/// Evaluates a branch condition and selects which subtree survives.
pub struct ConditionalExecutor;

impl StepExecutor for ConditionalExecutor {
    fn can_handle(&self, step: &WorkflowStep) -> bool {
        step.step_type == StepType::Conditional
    }

    fn execute<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<StepResult, StepError>> {
        Box::pin(async move {
            let start = std::time::Instant::now();

            let cond = step
                .condition
                .as_ref()
                .ok_or_else(|| StepError::Condition(format!("step '{}' has no condition", step.id)))?;

            let outcome =
                condition::evaluate(cond, &ctx.outputs, &ctx.statuses, &ctx.template_ctx())
                    .map_err(|e| StepError::Condition(e.to_string()))?;

            let (taken, dropped) = if outcome.result {
                (step.true_branch.clone(), step.false_branch.clone())
            } else {
                (step.false_branch.clone(), step.true_branch.clone())
            };

            // The non-chosen branch and its transitive descendants are skipped.
            let skipped = match &dropped {
                Some(branch) => {
                    let dependents = dag::dependents_index(&ctx.definition);
                    dag::descendants_including(branch, &dependents)
                }
                None => Vec::new(),
            };

            tracing::debug!(
                thread_id = ctx.thread_id.as_str(),
                step_id = step.id.as_str(),
                result = outcome.result,
                taken = ?taken,
                skipped = skipped.len(),
                "conditional evaluated"
            );

            Ok(StepResult {
                status: StepStatus::Success,
                response: outcome.result.to_string(),
                session_id: None,
                error: None,
                duration_ms: start.elapsed().as_millis() as u64,
                outcome: StepOutcome::Branch {
                    condition_met: outcome.result,
                    taken,
                    skipped,
                },
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Parallel executor
// ---------------------------------------------------------------------------

/// Launches referenced child steps concurrently and joins their results.
pub struct ParallelExecutor {
    registry: Weak<ExecutorRegistry>,
}

impl StepExecutor for ParallelExecutor {
    fn can_handle(&self, step: &WorkflowStep) -> bool {
        step.step_type == StepType::Parallel
    }

    fn execute<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<StepResult, StepError>> {
        Box::pin(async move {
            let start = std::time::Instant::now();
            let registry = self
                .registry
                .upgrade()
                .ok_or_else(|| StepError::ExecutionFailed("executor registry dropped".to_string()))?;

            let children: Vec<WorkflowStep> = step
                .parallel_steps
                .iter()
                .filter_map(|id| ctx.step(id).cloned())
                .collect();

            let futures = children.iter().map(|child| {
                let registry = Arc::clone(&registry);
                let ctx = ctx.clone();
                async move {
                    let result = registry.dispatch(child, &ctx).await;
                    (child.id.clone(), result)
                }
            });
            let joined = futures_util::future::join_all(futures).await;

            let mut child_outputs = HashMap::new();
            let mut child_statuses = HashMap::new();
            let mut child_sessions = HashMap::new();
            let mut failures = Vec::new();

            for (child_id, result) in joined {
                match result {
                    Ok(result) => {
                        child_statuses.insert(child_id.clone(), result.status);
                        if let Some(session) = result.session_id {
                            child_sessions.insert(child_id.clone(), session);
                        }
                        if result.status != StepStatus::Success {
                            failures.push(format!(
                                "{child_id}: {}",
                                result.error.as_deref().unwrap_or("failed")
                            ));
                        }
                        child_outputs.insert(child_id, result.response);
                    }
                    Err(StepError::Cancelled { partial_response }) => {
                        child_outputs.insert(child_id.clone(), partial_response);
                        return Err(StepError::Cancelled { partial_response: String::new() });
                    }
                    Err(e) => {
                        child_statuses.insert(child_id.clone(), StepStatus::Failed);
                        failures.push(format!("{child_id}: {e}"));
                    }
                }
            }

            // Aggregate child outputs under the parallel step's id.
            let response = step
                .parallel_steps
                .iter()
                .filter_map(|id| child_outputs.get(id).map(|out| format!("{id}: {out}")))
                .collect::<Vec<_>>()
                .join("\n");

            let status = if failures.is_empty() { StepStatus::Success } else { StepStatus::Failed };

            Ok(StepResult {
                status,
                response,
                session_id: None,
                error: if failures.is_empty() { None } else { Some(failures.join("; ")) },
                duration_ms: start.elapsed().as_millis() as u64,
                outcome: StepOutcome::Parallel { child_outputs, child_statuses, child_sessions },
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Loop executor
// ---------------------------------------------------------------------------

/// Fallback iteration cap for `while` loops without `maxIterations`.
const DEFAULT_WHILE_CAP: u32 = 100;

/// Iterates the loop body until the condition fails, the cap is reached, or
/// (for `retry`) the body succeeds.
pub struct LoopExecutor {
    registry: Weak<ExecutorRegistry>,
}

impl StepExecutor for LoopExecutor {
    fn can_handle(&self, step: &WorkflowStep) -> bool {
        step.step_type == StepType::Loop
    }

    fn execute<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<StepResult, StepError>> {
        Box::pin(async move {
            let start = std::time::Instant::now();
            let registry = self
                .registry
                .upgrade()
                .ok_or_else(|| StepError::ExecutionFailed("executor registry dropped".to_string()))?;

            let loop_type = step.loop_type.ok_or_else(|| {
                StepError::ExecutionFailed(format!("loop step '{}' has no loopType", step.id))
            })?;
            let cap = step.max_iterations.unwrap_or(DEFAULT_WHILE_CAP).max(1);

            let body: Vec<WorkflowStep> = step
                .loop_steps
                .iter()
                .filter_map(|id| ctx.step(id).cloned())
                .collect();

            // Local context accumulates body outputs across iterations.
            let mut local = ctx.clone();
            let mut iterations = 0u32;
            let mut completed = false;
            let mut last_error: Option<String> = None;
            let mut last_output = String::new();

            'iterate: while iterations < cap {
                if local.cancel.is_cancelled() {
                    return Err(StepError::Cancelled { partial_response: last_output });
                }

                if loop_type == LoopType::While {
                    let cond = step.loop_condition.as_ref().ok_or_else(|| {
                        StepError::Condition(format!("while loop '{}' has no loopCondition", step.id))
                    })?;
                    let outcome = condition::evaluate(
                        cond,
                        &local.outputs,
                        &local.statuses,
                        &local.template_ctx(),
                    )
                    .map_err(|e| StepError::Condition(e.to_string()))?;
                    if !outcome.result {
                        completed = true;
                        break;
                    }
                }

                let mut body_failed = false;
                for child in &body {
                    let result = registry.dispatch(child, &local).await;
                    match result {
                        Ok(result) => {
                            last_output = result.response.clone();
                            local.outputs.insert(child.id.clone(), result.response);
                            local.statuses.insert(child.id.clone(), result.status);
                            if let Some(session) = result.session_id {
                                local.sessions.insert(child.id.clone(), session);
                            }
                            if result.status != StepStatus::Success {
                                last_error = result.error.clone();
                                body_failed = true;
                                break;
                            }
                        }
                        Err(StepError::Cancelled { partial_response }) => {
                            return Err(StepError::Cancelled { partial_response });
                        }
                        Err(e) => {
                            last_error = Some(e.to_string());
                            local.statuses.insert(child.id.clone(), StepStatus::Failed);
                            body_failed = true;
                            break;
                        }
                    }
                }

                iterations += 1;

                match loop_type {
                    LoopType::Retry => {
                        if !body_failed {
                            completed = true;
                            break 'iterate;
                        }
                        // Retryable attempt failed: go around again.
                    }
                    LoopType::While | LoopType::For => {
                        if body_failed {
                            break 'iterate;
                        }
                        if loop_type == LoopType::For && iterations >= cap {
                            completed = true;
                        }
                    }
                }
            }

            // Collect only body-owned entries for the fold-back.
            let body_ids: std::collections::HashSet<&str> =
                step.loop_steps.iter().map(String::as_str).collect();
            let child_outputs: HashMap<String, String> = local
                .outputs
                .iter()
                .filter(|(k, _)| body_ids.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let child_statuses: HashMap<String, StepStatus> = local
                .statuses
                .iter()
                .filter(|(k, _)| body_ids.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), *v))
                .collect();
            let child_sessions: HashMap<String, String> = local
                .sessions
                .iter()
                .filter(|(k, _)| body_ids.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            let failed = match loop_type {
                LoopType::Retry => !completed,
                _ => last_error.is_some(),
            };

            tracing::debug!(
                thread_id = ctx.thread_id.as_str(),
                step_id = step.id.as_str(),
                loop_type = ?loop_type,
                iterations,
                completed,
                "loop finished"
            );

            Ok(StepResult {
                status: if failed { StepStatus::Failed } else { StepStatus::Success },
                response: last_output,
                session_id: None,
                error: if failed {
                    Some(last_error.unwrap_or_else(|| {
                        format!("loop did not complete within {cap} iterations")
                    }))
                } else {
                    None
                },
                duration_ms: start.elapsed().as_millis() as u64,
                outcome: StepOutcome::Loop {
                    iterations,
                    completed,
                    child_outputs,
                    child_statuses,
                    child_sessions,
                },
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Human executor
// ---------------------------------------------------------------------------

/// Creates an approval and suspends the thread; on resume, maps the
/// approval's terminal state onto the step.
pub struct HumanExecutor {
    approvals: Arc<dyn ApprovalGate>,
}

impl StepExecutor for HumanExecutor {
    fn can_handle(&self, step: &WorkflowStep) -> bool {
        step.step_type == StepType::Human
    }

    fn execute<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<StepResult, StepError>> {
        Box::pin(async move {
            let start = std::time::Instant::now();
            let behavior = step.timeout_behavior.unwrap_or_default();

            let existing = self.approvals.find_for_step(&ctx.thread_id, &step.id).await?;

            let approval = match existing {
                Some(approval) if approval.is_terminal() => {
                    let result = match approval.status {
                        ApprovalStatus::Approved => StepResult {
                            status: StepStatus::Success,
                            response: approval
                                .decision_comment
                                .clone()
                                .unwrap_or_else(|| "approved".to_string()),
                            session_id: None,
                            error: None,
                            duration_ms: start.elapsed().as_millis() as u64,
                            outcome: StepOutcome::Task { verdict: None },
                        },
                        ApprovalStatus::Rejected => StepResult::failed(
                            format!(
                                "rejected by {}",
                                approval.resolved_by.as_deref().unwrap_or("unknown")
                            ),
                            start.elapsed().as_millis() as u64,
                        ),
                        ApprovalStatus::Cancelled => StepResult::failed(
                            "approval cancelled",
                            start.elapsed().as_millis() as u64,
                        ),
                        ApprovalStatus::Expired => match behavior {
                            TimeoutBehavior::AutoApprove => StepResult {
                                status: StepStatus::Success,
                                response: "auto-approved on timeout".to_string(),
                                session_id: None,
                                error: None,
                                duration_ms: start.elapsed().as_millis() as u64,
                                outcome: StepOutcome::Task { verdict: None },
                            },
                            _ => StepResult::failed(
                                "approval expired",
                                start.elapsed().as_millis() as u64,
                            ),
                        },
                        ApprovalStatus::Pending => unreachable!("terminal check"),
                    };
                    return Ok(result);
                }
                Some(pending) => pending,
                None => {
                    let risk_level = step
                        .config
                        .get("riskLevel")
                        .and_then(|v| serde_json::from_value::<RiskLevel>(v.clone()).ok());
                    self.approvals
                        .open(CreateApprovalRequest {
                            thread_id: ctx.thread_id.clone(),
                            step_id: step.id.clone(),
                            project_id: ctx.project_id.clone(),
                            prompt: ctx.resolve(step.prompt.as_deref().unwrap_or_default()),
                            risk_level,
                            timeout_seconds: step.timeout_seconds,
                            timeout_behavior: Some(behavior),
                            context_data: None,
                        })
                        .await?
                }
            };

            Ok(StepResult {
                status: StepStatus::AwaitingApproval,
                response: String::new(),
                session_id: None,
                error: None,
                duration_ms: start.elapsed().as_millis() as u64,
                outcome: StepOutcome::Suspended { approval_id: approval.id.to_string() },
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::service::{ApprovalService, LogNotificationSink};
    use crate::llm::mock::MockLlmProvider;
    use crate::llm::provider::BoxLlmProvider;
    use crate::repository::memory::InMemoryApprovalStore;
    use crate::workflow::operator::StaticOperator;
    use serde_json::json;
    use studio_types::condition::Condition;
    use studio_types::workflow::VerdictKind;

    fn registry_with(
        responses: Vec<&str>,
        verdict: VerdictKind,
    ) -> (Arc<ExecutorRegistry>, Arc<ApprovalService<InMemoryApprovalStore>>, EventBus) {
        let events = EventBus::new(256);
        let llm = Arc::new(SessionLlm::new(Arc::new(BoxLlmProvider::new(
            MockLlmProvider::scripted(responses.into_iter().map(String::from).collect()),
        ))));
        let approvals = Arc::new(ApprovalService::new(
            InMemoryApprovalStore::new(),
            events.clone(),
            Arc::new(LogNotificationSink),
        ));
        let registry = ExecutorRegistry::standard(
            llm,
            Arc::new(StaticOperator(verdict)),
            approvals.clone(),
            events.clone(),
            EngineConfig::default(),
        );
        (registry, approvals, events)
    }

    fn ctx_for(steps: Vec<WorkflowStep>) -> StepContext {
        let agents: HashMap<String, AgentConfig> = steps
            .iter()
            .filter(|s| s.step_type == StepType::Task)
            .map(|s| (s.id.clone(), AgentConfig::for_role(s.role.as_deref().unwrap_or("dev"))))
            .collect();
        // Mirror the executor: every defined step starts out pending.
        let statuses = steps
            .iter()
            .map(|s| (s.id.clone(), StepStatus::Pending))
            .collect();
        StepContext {
            thread_id: "t-1".to_string(),
            project_id: None,
            outputs: HashMap::new(),
            statuses,
            sessions: HashMap::new(),
            agents: Arc::new(agents),
            definition: Arc::new(steps),
            cancel: CancellationToken::new(),
        }
    }

    fn mock_step(id: &str, task: &str) -> WorkflowStep {
        let mut step = WorkflowStep::task(id, "dev", task, &[]);
        step.step_type = StepType::Mock;
        step.role = None;
        step
    }

    // -------------------------------------------------------------------
    // Claude executor
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn claude_step_resolves_templates_and_streams_tokens() {
        let (registry, _, events) = registry_with(vec![], VerdictKind::Success);
        let step = WorkflowStep::task("b", "dev", "echo {a.output}", &["a"]);
        let mut ctx = ctx_for(vec![step.clone()]);
        ctx.outputs.insert("a".to_string(), "ok".to_string());
        ctx.statuses.insert("a".to_string(), StepStatus::Success);

        let mut rx = events.subscribe();
        let result = registry.dispatch(&step, &ctx).await.unwrap();

        // Echo provider returns the resolved prompt.
        assert_eq!(result.response, "echo ok");
        assert_eq!(result.status, StepStatus::Success);
        assert!(result.session_id.is_some());

        let mut saw_token = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, WorkflowEvent::AgentToken { .. }) {
                saw_token = true;
            }
        }
        assert!(saw_token, "expected agent:token-emitted events");
    }

    #[tokio::test]
    async fn claude_step_without_agent_fails() {
        let (registry, _, _) = registry_with(vec![], VerdictKind::Success);
        let step = WorkflowStep::task("solo", "dev", "hi", &[]);
        let mut ctx = ctx_for(vec![step.clone()]);
        ctx.agents = Arc::new(HashMap::new());

        let err = registry.dispatch(&step, &ctx).await.unwrap_err();
        assert!(matches!(err, StepError::AgentUnresolved(_)));
    }

    #[tokio::test]
    async fn claude_step_verdict_drives_status() {
        let (registry, _, _) = registry_with(vec!["I could not proceed"], VerdictKind::Blocked);
        let step = WorkflowStep::task("a", "dev", "try it", &[]);
        let ctx = ctx_for(vec![step.clone()]);

        let result = registry.dispatch(&step, &ctx).await.unwrap();
        assert_eq!(result.status, StepStatus::Blocked);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn claude_step_cancellation_preserves_partial_output() {
        let (registry, _, _) = registry_with(vec!["never delivered"], VerdictKind::Success);
        let step = WorkflowStep::task("a", "dev", "hi", &[]);
        let ctx = ctx_for(vec![step.clone()]);
        ctx.cancel.cancel();

        let err = registry.dispatch(&step, &ctx).await.unwrap_err();
        assert!(matches!(err, StepError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn claude_step_reuses_session() {
        let (registry, _, _) = registry_with(vec![], VerdictKind::Success);
        let step = WorkflowStep::task("a", "dev", "hi", &[]);
        let mut ctx = ctx_for(vec![step.clone()]);
        ctx.sessions.insert("a".to_string(), "sess-prior".to_string());

        let result = registry.dispatch(&step, &ctx).await.unwrap();
        assert_eq!(result.session_id.as_deref(), Some("sess-prior"));
    }

    // -------------------------------------------------------------------
    // Mock executor
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn mock_step_echoes_resolved_task() {
        let (registry, _, _) = registry_with(vec![], VerdictKind::Success);
        let step = mock_step("m", "emit {a.output}");
        let mut ctx = ctx_for(vec![step.clone()]);
        ctx.outputs.insert("a".to_string(), "ok".to_string());
        ctx.statuses.insert("a".to_string(), StepStatus::Success);

        let result = registry.dispatch(&step, &ctx).await.unwrap();
        assert_eq!(result.response, "emit ok");
        assert_eq!(result.status, StepStatus::Success);
    }

    #[tokio::test]
    async fn mock_step_pattern_matching() {
        let (registry, _, _) = registry_with(vec![], VerdictKind::Success);
        let mut step = mock_step("m", "deploy to staging");
        step.config.insert(
            "mockResponses".to_string(),
            json!([
                {"pattern": "production", "response": "denied"},
                {"pattern": "staging", "response": "deployed"}
            ]),
        );
        let ctx = ctx_for(vec![step.clone()]);
        let result = registry.dispatch(&step, &ctx).await.unwrap();
        assert_eq!(result.response, "deployed");
    }

    #[tokio::test]
    async fn mock_step_respects_delay() {
        let (registry, _, _) = registry_with(vec![], VerdictKind::Success);
        let mut step = mock_step("m", "slow");
        step.config.insert("mockDelay".to_string(), json!(30));
        let ctx = ctx_for(vec![step.clone()]);

        let start = std::time::Instant::now();
        registry.dispatch(&step, &ctx).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    // -------------------------------------------------------------------
    // Conditional executor
    // -------------------------------------------------------------------

    fn conditional_fixture(condition: Condition) -> (WorkflowStep, Vec<WorkflowStep>) {
        let check = mock_step("check", "probe");
        let mut cond = WorkflowStep::task("cond", "dev", "", &["check"]);
        cond.step_type = StepType::Conditional;
        cond.role = None;
        cond.condition = Some(condition);
        cond.true_branch = Some("yes".to_string());
        cond.false_branch = Some("no".to_string());
        let mut yes = mock_step("yes", "yes path");
        yes.deps = vec!["cond".to_string()];
        let mut no = mock_step("no", "no path");
        no.deps = vec!["cond".to_string()];
        let mut after_no = mock_step("after-no", "downstream of no");
        after_no.deps = vec!["no".to_string()];
        (cond.clone(), vec![check, cond, yes, no, after_no])
    }

    #[tokio::test]
    async fn conditional_true_skips_false_branch_subtree() {
        let (cond, steps) =
            conditional_fixture(Condition::Legacy("{check.output} === \"valid\"".to_string()));
        let mut ctx = ctx_for(steps);
        ctx.outputs.insert("check".to_string(), "valid".to_string());
        ctx.statuses.insert("check".to_string(), StepStatus::Success);

        let (registry, _, _) = registry_with(vec![], VerdictKind::Success);
        let result = registry.dispatch(&cond, &ctx).await.unwrap();

        match result.outcome {
            StepOutcome::Branch { condition_met, taken, skipped } => {
                assert!(condition_met);
                assert_eq!(taken.as_deref(), Some("yes"));
                assert!(skipped.contains(&"no".to_string()));
                assert!(skipped.contains(&"after-no".to_string()));
                assert!(!skipped.contains(&"yes".to_string()));
            }
            other => panic!("expected branch outcome, got {other:?}"),
        }
        assert_eq!(result.response, "true");
    }

    #[tokio::test]
    async fn conditional_false_takes_false_branch() {
        let (cond, steps) =
            conditional_fixture(Condition::Legacy("{check.output} === \"broken\"".to_string()));
        let mut ctx = ctx_for(steps);
        ctx.outputs.insert("check".to_string(), "ready".to_string());
        ctx.statuses.insert("check".to_string(), StepStatus::Success);

        let (registry, _, _) = registry_with(vec![], VerdictKind::Success);
        let result = registry.dispatch(&cond, &ctx).await.unwrap();

        match result.outcome {
            StepOutcome::Branch { condition_met, taken, skipped } => {
                assert!(!condition_met);
                assert_eq!(taken.as_deref(), Some("no"));
                assert_eq!(skipped, vec!["yes".to_string()]);
            }
            other => panic!("expected branch outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn conditional_parse_error_fails_step() {
        let (cond, steps) = conditional_fixture(Condition::Legacy("@@@".to_string()));
        let ctx = ctx_for(steps);
        let (registry, _, _) = registry_with(vec![], VerdictKind::Success);
        let err = registry.dispatch(&cond, &ctx).await.unwrap_err();
        assert!(matches!(err, StepError::Condition(_)));
    }

    // -------------------------------------------------------------------
    // Parallel executor
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn parallel_aggregates_child_outputs() {
        let a = mock_step("a", "alpha");
        let b = mock_step("b", "beta");
        let mut par = WorkflowStep::task("par", "dev", "", &[]);
        par.step_type = StepType::Parallel;
        par.role = None;
        par.parallel_steps = vec!["a".to_string(), "b".to_string()];

        let ctx = ctx_for(vec![a, b, par.clone()]);
        let (registry, _, _) = registry_with(vec![], VerdictKind::Success);
        let result = registry.dispatch(&par, &ctx).await.unwrap();

        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.response, "a: alpha\nb: beta");
        match result.outcome {
            StepOutcome::Parallel { child_outputs, child_statuses, .. } => {
                assert_eq!(child_outputs["a"], "alpha");
                assert_eq!(child_statuses["b"], StepStatus::Success);
            }
            other => panic!("expected parallel outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn parallel_child_failure_fails_parent() {
        // A task child with no resolvable agent fails dispatch.
        let mut bad = WorkflowStep::task("bad", "ghost-role", "x", &[]);
        bad.role = Some("ghost-role".to_string());
        let good = mock_step("good", "fine");
        let mut par = WorkflowStep::task("par", "dev", "", &[]);
        par.step_type = StepType::Parallel;
        par.role = None;
        par.parallel_steps = vec!["bad".to_string(), "good".to_string()];

        let mut ctx = ctx_for(vec![bad, good, par.clone()]);
        ctx.agents = Arc::new(HashMap::new());

        let (registry, _, _) = registry_with(vec![], VerdictKind::Success);
        let result = registry.dispatch(&par, &ctx).await.unwrap();
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.unwrap().contains("bad"));
        match result.outcome {
            StepOutcome::Parallel { child_statuses, .. } => {
                assert_eq!(child_statuses["bad"], StepStatus::Failed);
                assert_eq!(child_statuses["good"], StepStatus::Success);
            }
            other => panic!("expected parallel outcome, got {other:?}"),
        }
    }

    // -------------------------------------------------------------------
    // Loop executor
    // -------------------------------------------------------------------

    fn loop_step(loop_type: LoopType, body: &str, max: Option<u32>) -> WorkflowStep {
        let mut lp = WorkflowStep::task("lp", "dev", "", &[]);
        lp.step_type = StepType::Loop;
        lp.role = None;
        lp.loop_type = Some(loop_type);
        lp.loop_steps = vec![body.to_string()];
        lp.max_iterations = max;
        lp
    }

    #[tokio::test]
    async fn for_loop_runs_exactly_max_iterations() {
        let body = mock_step("body", "work");
        let lp = loop_step(LoopType::For, "body", Some(3));
        let ctx = ctx_for(vec![body, lp.clone()]);
        let (registry, _, _) = registry_with(vec![], VerdictKind::Success);

        let result = registry.dispatch(&lp, &ctx).await.unwrap();
        assert_eq!(result.status, StepStatus::Success);
        match result.outcome {
            StepOutcome::Loop { iterations, completed, .. } => {
                assert_eq!(iterations, 3);
                assert!(completed);
            }
            other => panic!("expected loop outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn while_loop_stops_when_condition_false() {
        let body = mock_step("body", "tick");
        let mut lp = loop_step(LoopType::While, "body", Some(10));
        // Body output is "tick"; loop while the body has NOT run yet.
        lp.loop_condition =
            Some(Condition::Legacy("{body.output} !== \"tick\"".to_string()));
        let ctx = ctx_for(vec![body, lp.clone()]);
        let (registry, _, _) = registry_with(vec![], VerdictKind::Success);

        let result = registry.dispatch(&lp, &ctx).await.unwrap();
        match result.outcome {
            StepOutcome::Loop { iterations, completed, .. } => {
                assert_eq!(iterations, 1);
                assert!(completed);
            }
            other => panic!("expected loop outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_loop_succeeds_after_transient_failures() {
        // Task body classified Failed twice, then Success.
        let events = EventBus::new(64);
        let llm = Arc::new(SessionLlm::new(Arc::new(BoxLlmProvider::new(
            MockLlmProvider::scripted(vec![
                "err".to_string(),
                "err".to_string(),
                "done".to_string(),
            ]),
        ))));
        let approvals = Arc::new(ApprovalService::new(
            InMemoryApprovalStore::new(),
            events.clone(),
            Arc::new(LogNotificationSink),
        ));

        struct FlakyOperator;
        impl ResponseOperator for FlakyOperator {
            fn classify<'a>(&'a self, input: OperatorInput<'a>) -> BoxFuture<'a, studio_types::workflow::Verdict> {
                let failed = input.response == "err";
                Box::pin(async move {
                    studio_types::workflow::Verdict {
                        verdict: if failed { VerdictKind::Failed } else { VerdictKind::Success },
                        confidence: 1.0,
                        reason: "scripted".to_string(),
                    }
                })
            }
        }

        let registry = ExecutorRegistry::standard(
            llm,
            Arc::new(FlakyOperator),
            approvals,
            events,
            EngineConfig::default(),
        );

        let body = WorkflowStep::task("body", "dev", "attempt", &[]);
        let lp = loop_step(LoopType::Retry, "body", Some(5));
        let ctx = ctx_for(vec![body, lp.clone()]);

        let result = registry.dispatch(&lp, &ctx).await.unwrap();
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.response, "done");
        match result.outcome {
            StepOutcome::Loop { iterations, completed, child_statuses, .. } => {
                assert_eq!(iterations, 3);
                assert!(completed);
                assert_eq!(child_statuses["body"], StepStatus::Success);
            }
            other => panic!("expected loop outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_loop_exhaustion_fails() {
        let (registry, _, _) = registry_with(vec![], VerdictKind::Failed);
        let body = WorkflowStep::task("body", "dev", "attempt", &[]);
        let lp = loop_step(LoopType::Retry, "body", Some(2));
        let ctx = ctx_for(vec![body, lp.clone()]);

        let result = registry.dispatch(&lp, &ctx).await.unwrap();
        assert_eq!(result.status, StepStatus::Failed);
        match result.outcome {
            StepOutcome::Loop { iterations, completed, .. } => {
                assert_eq!(iterations, 2);
                assert!(!completed);
            }
            other => panic!("expected loop outcome, got {other:?}"),
        }
    }

    // -------------------------------------------------------------------
    // Human executor
    // -------------------------------------------------------------------

    fn human_step(id: &str) -> WorkflowStep {
        let mut step = WorkflowStep::task(id, "dev", "", &[]);
        step.step_type = StepType::Human;
        step.role = None;
        step.prompt = Some("Approve {check.output}?".to_string());
        step.timeout_seconds = Some(300);
        step
    }

    #[tokio::test]
    async fn human_step_creates_approval_and_suspends() {
        let (registry, approvals, _) = registry_with(vec![], VerdictKind::Success);
        let step = human_step("review");
        let mut ctx = ctx_for(vec![step.clone()]);
        ctx.outputs.insert("check".to_string(), "the release".to_string());
        ctx.statuses.insert("check".to_string(), StepStatus::Success);

        let result = registry.dispatch(&step, &ctx).await.unwrap();
        assert_eq!(result.status, StepStatus::AwaitingApproval);
        let StepOutcome::Suspended { approval_id } = &result.outcome else {
            panic!("expected suspended outcome");
        };

        let stored = approvals
            .get(approval_id.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(stored.prompt, "Approve the release?");
        assert_eq!(stored.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn human_step_is_idempotent_while_pending() {
        let (registry, _, _) = registry_with(vec![], VerdictKind::Success);
        let step = human_step("review");
        let ctx = ctx_for(vec![step.clone()]);

        let first = registry.dispatch(&step, &ctx).await.unwrap();
        let second = registry.dispatch(&step, &ctx).await.unwrap();
        let (StepOutcome::Suspended { approval_id: id1 }, StepOutcome::Suspended { approval_id: id2 }) =
            (&first.outcome, &second.outcome)
        else {
            panic!("expected suspended outcomes");
        };
        assert_eq!(id1, id2, "re-dispatch must reuse the pending approval");
    }

    #[tokio::test]
    async fn human_step_resolves_after_decision() {
        use studio_types::approval::{ApprovalDecision, Decision};

        let (registry, approvals, _) = registry_with(vec![], VerdictKind::Success);
        let step = human_step("review");
        let ctx = ctx_for(vec![step.clone()]);

        let suspended = registry.dispatch(&step, &ctx).await.unwrap();
        let StepOutcome::Suspended { approval_id } = &suspended.outcome else {
            panic!("expected suspended outcome");
        };

        approvals
            .decide(
                approval_id.parse().unwrap(),
                ApprovalDecision {
                    decision: Decision::Approve,
                    decided_by: "alice".to_string(),
                    comment: Some("go".to_string()),
                },
            )
            .await
            .unwrap();

        let resumed = registry.dispatch(&step, &ctx).await.unwrap();
        assert_eq!(resumed.status, StepStatus::Success);
        assert_eq!(resumed.response, "go");
    }

    #[tokio::test]
    async fn human_step_rejection_fails() {
        use studio_types::approval::{ApprovalDecision, Decision};

        let (registry, approvals, _) = registry_with(vec![], VerdictKind::Success);
        let step = human_step("review");
        let ctx = ctx_for(vec![step.clone()]);

        let suspended = registry.dispatch(&step, &ctx).await.unwrap();
        let StepOutcome::Suspended { approval_id } = &suspended.outcome else {
            panic!("expected suspended outcome");
        };
        approvals
            .decide(
                approval_id.parse().unwrap(),
                ApprovalDecision {
                    decision: Decision::Reject,
                    decided_by: "bob".to_string(),
                    comment: None,
                },
            )
            .await
            .unwrap();

        let resumed = registry.dispatch(&step, &ctx).await.unwrap();
        assert_eq!(resumed.status, StepStatus::Failed);
        assert!(resumed.error.unwrap().contains("bob"));
    }

    #[tokio::test]
    async fn human_step_expiry_honors_timeout_behavior() {
        let (registry, approvals, _) = registry_with(vec![], VerdictKind::Success);

        // fail behavior
        let step = human_step("review");
        let ctx = ctx_for(vec![step.clone()]);
        let suspended = registry.dispatch(&step, &ctx).await.unwrap();
        let StepOutcome::Suspended { approval_id } = &suspended.outcome else {
            panic!("expected suspended outcome");
        };
        let id: uuid::Uuid = approval_id.parse().unwrap();
        // Force the deadline into the past, then sweep.
        approvals_update_expiry(&approvals, id).await;
        approvals.process_expired().await.unwrap();

        let resumed = registry.dispatch(&step, &ctx).await.unwrap();
        assert_eq!(resumed.status, StepStatus::Failed);
        assert!(resumed.error.unwrap().contains("expired"));

        // auto-approve behavior
        let mut auto = human_step("auto-review");
        auto.timeout_behavior = Some(TimeoutBehavior::AutoApprove);
        let ctx = ctx_for(vec![auto.clone()]);
        let suspended = registry.dispatch(&auto, &ctx).await.unwrap();
        let StepOutcome::Suspended { approval_id } = &suspended.outcome else {
            panic!("expected suspended outcome");
        };
        let id: uuid::Uuid = approval_id.parse().unwrap();
        approvals_update_expiry(&approvals, id).await;
        approvals.process_expired().await.unwrap();

        let resumed = registry.dispatch(&auto, &ctx).await.unwrap();
        assert_eq!(resumed.status, StepStatus::Success);
        assert_eq!(resumed.response, "auto-approved on timeout");
    }

    /// Test helper: push an approval's deadline into the past.
    async fn approvals_update_expiry(
        approvals: &Arc<ApprovalService<InMemoryApprovalStore>>,
        id: uuid::Uuid,
    ) {
        use crate::repository::approval::ApprovalStore;
        let mut record = approvals.get(id).await.unwrap();
        record.expires_at = Some(Utc::now() - chrono::Duration::seconds(5));
        approvals.store_for_tests().update(&record).await.unwrap();
    }
}
