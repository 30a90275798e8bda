//! Approval domain types.
//!
//! An approval is a suspended human step awaiting an external decision. The
//! approval service owns these records; the executor only holds approval ids.
//! A terminal status is never re-opened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::TimeoutBehavior;

/// Default approval timeout, one hour.
pub const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 3600;
/// Lower bound on configurable approval timeouts.
pub const MIN_APPROVAL_TIMEOUT_SECS: u64 = 60;
/// Upper bound on configurable approval timeouts, one day.
pub const MAX_APPROVAL_TIMEOUT_SECS: u64 = 86_400;

/// A pending or resolved approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: Uuid,
    pub thread_id: String,
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub prompt: String,
    pub risk_level: RiskLevel,
    pub status: ApprovalStatus,
    pub timeout_behavior: TimeoutBehavior,
    pub requested_at: DateTime<Utc>,
    /// Absent when `timeout_behavior` is `infinite`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_data: Option<serde_json::Value>,
}

impl Approval {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Request to create an approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApprovalRequest {
    pub thread_id: String,
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_behavior: Option<TimeoutBehavior>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_data: Option<serde_json::Value>,
}

/// A human decision on a pending approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    pub decision: Decision,
    pub decided_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

/// Filters for listing approvals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status: Vec<ApprovalStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    /// Substring match against the prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

/// One page of approvals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalPage {
    pub items: Vec<Approval>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Approval {
        Approval {
            id: Uuid::now_v7(),
            thread_id: "t-1".to_string(),
            step_id: "review".to_string(),
            project_id: Some("proj".to_string()),
            prompt: "Ship it?".to_string(),
            risk_level: RiskLevel::High,
            status: ApprovalStatus::Pending,
            timeout_behavior: TimeoutBehavior::Fail,
            requested_at: Utc::now(),
            expires_at: Some(Utc::now()),
            resolved_by: None,
            resolved_at: None,
            decision_comment: None,
            assigned_to: None,
            context_data: None,
        }
    }

    #[test]
    fn approval_json_roundtrip() {
        let approval = sample();
        let json = serde_json::to_string(&approval).unwrap();
        assert!(json.contains("\"threadId\":\"t-1\""));
        assert!(json.contains("\"riskLevel\":\"high\""));
        let parsed: Approval = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.step_id, "review");
        assert_eq!(parsed.status, ApprovalStatus::Pending);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ApprovalStatus::Pending.is_terminal());
        for s in [
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
            ApprovalStatus::Expired,
            ApprovalStatus::Cancelled,
        ] {
            assert!(s.is_terminal(), "{s:?} should be terminal");
        }
    }

    #[test]
    fn risk_level_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn decision_wire_names() {
        assert_eq!(serde_json::to_string(&Decision::Approve).unwrap(), "\"approve\"");
        assert_eq!(serde_json::to_string(&Decision::Reject).unwrap(), "\"reject\"");
    }
}
