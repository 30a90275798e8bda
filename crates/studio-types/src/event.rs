//! Progress events published on the workflow event bus.
//!
//! `WorkflowEvent` is the unified event type broadcast during thread
//! execution. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels. Wire names follow the `domain:event` convention
//! (`workflow:step-completed`, `approval:resolved`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{StepStatus, ThreadStatus};

/// Events emitted during workflow thread execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum WorkflowEvent {
    /// A thread has started (or resumed) executing.
    #[serde(rename = "workflow:started")]
    WorkflowStarted {
        thread_id: String,
        project_id: Option<String>,
        resumed: bool,
    },

    /// A step has started executing.
    #[serde(rename = "workflow:step-started")]
    StepStarted {
        thread_id: String,
        step_id: String,
        step_type: String,
    },

    /// A step finished successfully (or was skipped).
    #[serde(rename = "workflow:step-completed")]
    StepCompleted {
        thread_id: String,
        step_id: String,
        status: StepStatus,
        duration_ms: u64,
    },

    /// A step failed.
    #[serde(rename = "workflow:step-failed")]
    StepFailed {
        thread_id: String,
        step_id: String,
        error: String,
    },

    /// The thread suspended awaiting a human approval.
    #[serde(rename = "workflow:suspended")]
    WorkflowSuspended {
        thread_id: String,
        step_id: String,
        approval_id: Uuid,
    },

    /// The thread reached a settled final status.
    #[serde(rename = "workflow:completed")]
    WorkflowCompleted {
        thread_id: String,
        status: ThreadStatus,
        duration_ms: u64,
    },

    /// The thread was aborted.
    #[serde(rename = "workflow:aborted")]
    WorkflowAborted { thread_id: String },

    /// An approval request was created.
    #[serde(rename = "approval:created")]
    ApprovalCreated {
        approval_id: Uuid,
        thread_id: String,
        step_id: String,
        expires_at: Option<DateTime<Utc>>,
    },

    /// An approval reached a terminal decision.
    #[serde(rename = "approval:resolved")]
    ApprovalResolved {
        approval_id: Uuid,
        thread_id: String,
        step_id: String,
        approved: bool,
        resolved_by: String,
    },

    /// An approval expired via the sweep.
    #[serde(rename = "approval:expired")]
    ApprovalExpired {
        approval_id: Uuid,
        thread_id: String,
        step_id: String,
    },

    /// A streaming token from an agent invocation.
    #[serde(rename = "agent:token-emitted")]
    AgentToken {
        thread_id: String,
        step_id: String,
        text: String,
    },

    /// An agent invoked a tool mid-stream.
    #[serde(rename = "agent:tool-invoked")]
    AgentToolInvoked {
        thread_id: String,
        step_id: String,
        tool: String,
    },
}

impl WorkflowEvent {
    /// The thread this event belongs to. Every variant is thread-scoped.
    pub fn thread_id(&self) -> &str {
        match self {
            WorkflowEvent::WorkflowStarted { thread_id, .. }
            | WorkflowEvent::StepStarted { thread_id, .. }
            | WorkflowEvent::StepCompleted { thread_id, .. }
            | WorkflowEvent::StepFailed { thread_id, .. }
            | WorkflowEvent::WorkflowSuspended { thread_id, .. }
            | WorkflowEvent::WorkflowCompleted { thread_id, .. }
            | WorkflowEvent::WorkflowAborted { thread_id }
            | WorkflowEvent::ApprovalCreated { thread_id, .. }
            | WorkflowEvent::ApprovalResolved { thread_id, .. }
            | WorkflowEvent::ApprovalExpired { thread_id, .. }
            | WorkflowEvent::AgentToken { thread_id, .. }
            | WorkflowEvent::AgentToolInvoked { thread_id, .. } => thread_id,
        }
    }

    /// The wire name of the event (the serde tag).
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStarted { .. } => "workflow:started",
            WorkflowEvent::StepStarted { .. } => "workflow:step-started",
            WorkflowEvent::StepCompleted { .. } => "workflow:step-completed",
            WorkflowEvent::StepFailed { .. } => "workflow:step-failed",
            WorkflowEvent::WorkflowSuspended { .. } => "workflow:suspended",
            WorkflowEvent::WorkflowCompleted { .. } => "workflow:completed",
            WorkflowEvent::WorkflowAborted { .. } => "workflow:aborted",
            WorkflowEvent::ApprovalCreated { .. } => "approval:created",
            WorkflowEvent::ApprovalResolved { .. } => "approval:resolved",
            WorkflowEvent::ApprovalExpired { .. } => "approval:expired",
            WorkflowEvent::AgentToken { .. } => "agent:token-emitted",
            WorkflowEvent::AgentToolInvoked { .. } => "agent:tool-invoked",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_completed_serde_roundtrip() {
        let event = WorkflowEvent::StepCompleted {
            thread_id: "t-1".to_string(),
            step_id: "a".to_string(),
            status: StepStatus::Success,
            duration_ms: 1500,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"workflow:step-completed\""));
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, WorkflowEvent::StepCompleted { duration_ms: 1500, .. }));
    }

    #[test]
    fn approval_resolved_serde_roundtrip() {
        let event = WorkflowEvent::ApprovalResolved {
            approval_id: Uuid::now_v7(),
            thread_id: "t-1".to_string(),
            step_id: "review".to_string(),
            approved: true,
            resolved_by: "alice".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"approval:resolved\""));
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, WorkflowEvent::ApprovalResolved { approved: true, .. }));
    }

    #[test]
    fn thread_id_accessor_covers_all_variants() {
        let events = vec![
            WorkflowEvent::WorkflowStarted {
                thread_id: "t".to_string(),
                project_id: None,
                resumed: false,
            },
            WorkflowEvent::WorkflowAborted { thread_id: "t".to_string() },
            WorkflowEvent::AgentToken {
                thread_id: "t".to_string(),
                step_id: "a".to_string(),
                text: "x".to_string(),
            },
            WorkflowEvent::ApprovalExpired {
                approval_id: Uuid::now_v7(),
                thread_id: "t".to_string(),
                step_id: "a".to_string(),
            },
        ];
        for event in events {
            assert_eq!(event.thread_id(), "t");
        }
    }

    #[test]
    fn name_matches_serde_tag() {
        let event = WorkflowEvent::AgentToken {
            thread_id: "t".to_string(),
            step_id: "a".to_string(),
            text: "x".to_string(),
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
    }
}
