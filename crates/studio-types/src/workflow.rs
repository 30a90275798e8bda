//! Workflow domain types for Studio.
//!
//! Defines the step shape accepted over the wire (`WorkflowStep`), the durable
//! per-thread execution state (`WorkflowState`, the checkpoint unit), and the
//! result types produced by step executors. All wire-facing structs use
//! camelCase field names to match the HTTP API.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;

// ---------------------------------------------------------------------------
// Step definition
// ---------------------------------------------------------------------------

/// One node in the workflow DAG.
///
/// A single flat struct rather than a per-type enum: the wire format sends
/// steps this way, and validation (`studio-core::workflow::definition`)
/// enforces the per-type field rules (e.g. a `conditional` step must carry
/// `condition` and at least one branch, a `task` step exactly one of
/// `role`/`agentId`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// User-assigned step id, unique within the workflow.
    pub id: String,
    /// The kind of step.
    #[serde(rename = "type", default)]
    pub step_type: StepType,
    /// Role to resolve against the agent directory (task steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Explicit agent id, bypassing role resolution (task steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Free-text prompt; may contain `{stepId.output}` template variables.
    #[serde(default)]
    pub task: String,
    /// Step ids this step depends on (DAG edges).
    #[serde(default)]
    pub deps: Vec<String>,
    /// Branch condition (conditional steps only). A JSON string is a legacy
    /// expression; an object is a structured v2.0 rule tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// Step executed when the condition holds (conditional steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_branch: Option<String>,
    /// Step executed when the condition fails (conditional steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub false_branch: Option<String>,
    /// Child step ids launched concurrently (parallel steps).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel_steps: Vec<String>,
    /// Loop flavor (loop steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_type: Option<LoopType>,
    /// Iteration cap; >= 1 (loop steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Continue-condition evaluated before each iteration (while loops).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_condition: Option<Condition>,
    /// Body step ids executed each iteration (loop steps).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loop_steps: Vec<String>,
    /// Prompt shown to the approver (human steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// What kind of human interaction is requested (human steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_type: Option<InteractionType>,
    /// What happens when the approval times out (human steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_behavior: Option<TimeoutBehavior>,
    /// Approval timeout in seconds, bounded [60, 86400] (human steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Free-form executor-specific configuration (e.g. `mockDelay`,
    /// `mockResponses`, `riskLevel`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, serde_json::Value>,
}

impl WorkflowStep {
    /// Minimal task step used pervasively by tests.
    pub fn task(id: &str, role: &str, task: &str, deps: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            step_type: StepType::Task,
            role: Some(role.to_string()),
            agent_id: None,
            task: task.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            condition: None,
            true_branch: None,
            false_branch: None,
            parallel_steps: Vec::new(),
            loop_type: None,
            max_iterations: None,
            loop_condition: None,
            loop_steps: Vec::new(),
            prompt: None,
            interaction_type: None,
            timeout_behavior: None,
            timeout_seconds: None,
            config: HashMap::new(),
        }
    }

    /// Whether this is a control-flow step (no agent binding allowed).
    pub fn is_control(&self) -> bool {
        matches!(
            self.step_type,
            StepType::Conditional | StepType::Parallel | StepType::Loop | StepType::Human
        )
    }
}

/// The kind of step in a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[default]
    Task,
    Conditional,
    Parallel,
    Loop,
    Human,
    Mock,
}

/// Loop flavor for `StepType::Loop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    /// Iterate while `loopCondition` evaluates true.
    While,
    /// Iterate exactly `maxIterations` times.
    For,
    /// Re-run the body until it succeeds or `maxIterations` is reached.
    Retry,
}

/// What a human step asks of a person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Approval,
    Notification,
    Input,
}

/// What happens when a human step's approval expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutBehavior {
    /// The waiting step fails; dependents become blocked.
    #[default]
    Fail,
    /// The approval resolves as approved on expiry.
    AutoApprove,
    /// The approval never expires; the thread stays suspended.
    Infinite,
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Status of an individual step within a thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Success,
    Blocked,
    Failed,
    Skipped,
    AwaitingApproval,
}

impl StepStatus {
    /// Terminal statuses satisfy a dependent's dependency check.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Skipped)
    }

    /// Statuses that can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Blocked | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Overall status of a workflow thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    #[default]
    Running,
    Completed,
    /// Some steps succeeded and some were blocked by failures.
    Partial,
    Failed,
    Aborted,
    /// Waiting on a human approval.
    Suspended,
}

impl ThreadStatus {
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ThreadStatus::Completed
                | ThreadStatus::Partial
                | ThreadStatus::Failed
                | ThreadStatus::Aborted
        )
    }
}

// ---------------------------------------------------------------------------
// Thread state (the checkpoint unit)
// ---------------------------------------------------------------------------

/// Durable per-thread execution state.
///
/// Created by the orchestrator on first invoke, mutated only by that thread's
/// executor, persisted by the checkpoint store after every transition. A
/// `threadId` is stable across resumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Immutable snapshot of the step definitions for this thread.
    pub definition: Vec<WorkflowStep>,
    /// Final response text per completed step.
    #[serde(default)]
    pub step_outputs: HashMap<String, String>,
    #[serde(default)]
    pub step_status: HashMap<String, StepStatus>,
    /// Opaque LLM session handles for conversation continuity.
    #[serde(default)]
    pub session_ids: HashMap<String, String>,
    /// Per-step error messages for failed steps.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub step_errors: HashMap<String, String>,
    /// Loop steps only: iterations completed so far.
    #[serde(default)]
    pub current_iteration: HashMap<String, u32>,
    /// Approval ids created by human steps, keyed by step id.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub approval_ids: HashMap<String, String>,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: ThreadStatus,
}

impl WorkflowState {
    /// Fresh state for a new thread; all steps pending.
    pub fn new(thread_id: String, project_id: Option<String>, definition: Vec<WorkflowStep>) -> Self {
        let now = Utc::now();
        let step_status = definition
            .iter()
            .map(|s| (s.id.clone(), StepStatus::Pending))
            .collect();
        Self {
            thread_id,
            project_id,
            definition,
            step_outputs: HashMap::new(),
            step_status,
            session_ids: HashMap::new(),
            step_errors: HashMap::new(),
            current_iteration: HashMap::new(),
            approval_ids: HashMap::new(),
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
            status: ThreadStatus::Running,
        }
    }

    pub fn status_of(&self, step_id: &str) -> StepStatus {
        self.step_status.get(step_id).copied().unwrap_or_default()
    }

    /// Look up a step definition by id.
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.definition.iter().find(|s| s.id == step_id)
    }
}

/// Lightweight projection of a thread for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub thread_id: String,
    pub status: ThreadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub step_statuses: HashMap<String, StepStatus>,
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// The operator's classification of an agent response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub verdict: VerdictKind,
    /// 0.0 ..= 1.0
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Success,
    Blocked,
    Failed,
}

impl VerdictKind {
    pub fn as_step_status(self) -> StepStatus {
        match self {
            VerdictKind::Success => StepStatus::Success,
            VerdictKind::Blocked => StepStatus::Blocked,
            VerdictKind::Failed => StepStatus::Failed,
        }
    }
}

/// What a step executor produced.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub status: StepStatus,
    /// Final response text recorded under the step id.
    pub response: String,
    /// LLM session handle to carry forward, if any.
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub outcome: StepOutcome,
}

/// Executor-specific detail attached to a `StepResult`.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Plain task (or mock) execution.
    Task { verdict: Option<Verdict> },
    /// Conditional branch selection.
    Branch {
        condition_met: bool,
        taken: Option<String>,
        /// The non-chosen branch and its transitive descendants.
        skipped: Vec<String>,
    },
    /// Parallel fan-out: child outputs/statuses to fold into the thread.
    Parallel {
        child_outputs: HashMap<String, String>,
        child_statuses: HashMap<String, StepStatus>,
        child_sessions: HashMap<String, String>,
    },
    /// Loop execution summary.
    Loop {
        iterations: u32,
        completed: bool,
        child_outputs: HashMap<String, String>,
        child_statuses: HashMap<String, StepStatus>,
        child_sessions: HashMap<String, String>,
    },
    /// Human gate: the thread must suspend until the approval resolves.
    Suspended { approval_id: String },
}

impl StepResult {
    /// Successful task result with no verdict attached.
    pub fn success(response: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: StepStatus::Success,
            response: response.into(),
            session_id: None,
            error: None,
            duration_ms,
            outcome: StepOutcome::Task { verdict: None },
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        let error = error.into();
        Self {
            status: StepStatus::Failed,
            response: String::new(),
            session_id: None,
            error: Some(error),
            duration_ms,
            outcome: StepOutcome::Task { verdict: None },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_json_roundtrip_camel_case() {
        let mut step = WorkflowStep::task("analyze", "dev", "echo {gather.output}", &["gather"]);
        step.timeout_seconds = Some(120);
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["id"], "analyze");
        assert_eq!(json["type"], "task");
        assert_eq!(json["deps"], json!(["gather"]));
        assert_eq!(json["timeoutSeconds"], 120);

        let parsed: WorkflowStep = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.id, "analyze");
        assert_eq!(parsed.role.as_deref(), Some("dev"));
    }

    #[test]
    fn step_type_defaults_to_task() {
        let parsed: WorkflowStep =
            serde_json::from_value(json!({"id": "a", "role": "dev", "task": "hi"})).unwrap();
        assert_eq!(parsed.step_type, StepType::Task);
        assert!(parsed.deps.is_empty());
    }

    #[test]
    fn human_step_fields_roundtrip() {
        let parsed: WorkflowStep = serde_json::from_value(json!({
            "id": "review",
            "type": "human",
            "prompt": "Ship it?",
            "interactionType": "approval",
            "timeoutBehavior": "auto-approve",
            "timeoutSeconds": 300,
            "deps": ["build"]
        }))
        .unwrap();
        assert_eq!(parsed.step_type, StepType::Human);
        assert_eq!(parsed.timeout_behavior, Some(TimeoutBehavior::AutoApprove));
        assert_eq!(parsed.interaction_type, Some(InteractionType::Approval));
        assert!(parsed.is_control());
    }

    #[test]
    fn timeout_behavior_wire_names_are_kebab_case() {
        assert_eq!(
            serde_json::to_string(&TimeoutBehavior::AutoApprove).unwrap(),
            "\"auto-approve\""
        );
        assert_eq!(serde_json::to_string(&TimeoutBehavior::Fail).unwrap(), "\"fail\"");
    }

    #[test]
    fn step_status_satisfaction() {
        assert!(StepStatus::Success.is_satisfied());
        assert!(StepStatus::Skipped.is_satisfied());
        assert!(!StepStatus::Failed.is_satisfied());
        assert!(!StepStatus::Blocked.is_satisfied());
        assert!(StepStatus::Failed.is_terminal());
        assert!(!StepStatus::AwaitingApproval.is_terminal());
    }

    #[test]
    fn awaiting_approval_wire_name() {
        assert_eq!(
            serde_json::to_string(&StepStatus::AwaitingApproval).unwrap(),
            "\"awaiting_approval\""
        );
    }

    #[test]
    fn state_new_marks_all_pending() {
        let steps = vec![
            WorkflowStep::task("a", "dev", "x", &[]),
            WorkflowStep::task("b", "dev", "y", &["a"]),
        ];
        let state = WorkflowState::new("t-1".to_string(), Some("proj".to_string()), steps);
        assert_eq!(state.status, ThreadStatus::Running);
        assert_eq!(state.status_of("a"), StepStatus::Pending);
        assert_eq!(state.status_of("b"), StepStatus::Pending);
        assert_eq!(state.status_of("missing"), StepStatus::Pending);
    }

    #[test]
    fn state_checkpoint_roundtrip() {
        let mut state = WorkflowState::new(
            "t-2".to_string(),
            None,
            vec![WorkflowStep::task("a", "dev", "x", &[])],
        );
        state.step_outputs.insert("a".to_string(), "ok".to_string());
        state.step_status.insert("a".to_string(), StepStatus::Success);
        state.session_ids.insert("a".to_string(), "sess-1".to_string());

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"threadId\":\"t-2\""));
        assert!(json.contains("\"stepOutputs\""));

        let restored: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.step_outputs["a"], "ok");
        assert_eq!(restored.status_of("a"), StepStatus::Success);
        assert_eq!(restored.session_ids["a"], "sess-1");
    }

    #[test]
    fn verdict_kind_maps_to_step_status() {
        assert_eq!(VerdictKind::Success.as_step_status(), StepStatus::Success);
        assert_eq!(VerdictKind::Blocked.as_step_status(), StepStatus::Blocked);
        assert_eq!(VerdictKind::Failed.as_step_status(), StepStatus::Failed);
    }

    #[test]
    fn thread_status_settled() {
        assert!(ThreadStatus::Completed.is_settled());
        assert!(ThreadStatus::Partial.is_settled());
        assert!(!ThreadStatus::Suspended.is_settled());
        assert!(!ThreadStatus::Running.is_settled());
    }
}
