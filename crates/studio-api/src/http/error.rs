//! Application error type mapping engine errors to HTTP status codes.
//!
//! The wire shape is `{"error": {"code": ..., "message": ...}}`; stack
//! traces never cross the boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use studio_core::approval::service::ApprovalError;
use studio_core::workflow::definition::WorkflowError;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Engine-side workflow errors.
    Workflow(WorkflowError),
    /// Approval lifecycle errors.
    Approval(ApprovalError),
    /// Request-shape validation outside the engine.
    Validation(String),
    /// Missing resource outside the engine error types.
    NotFound(String),
    /// Generic internal error.
    Internal(String),
}

impl From<WorkflowError> for AppError {
    fn from(e: WorkflowError) -> Self {
        AppError::Workflow(e)
    }
}

impl From<ApprovalError> for AppError {
    fn from(e: ApprovalError) -> Self {
        AppError::Approval(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Workflow(e) => match e {
                WorkflowError::ValidationError(_)
                | WorkflowError::CycleDetected(_)
                | WorkflowError::UnknownDependency(_)
                | WorkflowError::ConditionError(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
                }
                WorkflowError::AgentUnresolved { .. } => {
                    (StatusCode::NOT_FOUND, "AGENT_UNRESOLVED", e.to_string())
                }
                WorkflowError::UnknownThread(_) => {
                    (StatusCode::NOT_FOUND, "THREAD_NOT_FOUND", e.to_string())
                }
                WorkflowError::ExecutionError(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "EXECUTION_ERROR", e.to_string())
                }
            },
            AppError::Approval(e) => match e {
                ApprovalError::NotFound(_) => {
                    (StatusCode::NOT_FOUND, "APPROVAL_NOT_FOUND", e.to_string())
                }
                ApprovalError::AlreadyResolved(_) => {
                    (StatusCode::CONFLICT, "ALREADY_RESOLVED", e.to_string())
                }
                ApprovalError::Invalid(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
                }
                ApprovalError::Store(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", e.to_string())
                }
            },
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        };

        let body = json!({
            "error": {
                "code": code,
                "message": message,
            }
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
