//! Approval lifecycle endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use studio_types::approval::{
    Approval, ApprovalDecision, ApprovalFilter, ApprovalPage, ApprovalStatus,
    CreateApprovalRequest, RiskLevel,
};

use crate::http::error::AppError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query / body types
// ---------------------------------------------------------------------------

/// Query parameters for listing approvals.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListApprovalsQuery {
    #[serde(default)]
    pub project_id: Option<String>,
    /// Comma-separated status list, e.g. `pending,approved`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

#[derive(Debug, Deserialize)]
pub struct GetApprovalQuery {
    #[serde(default)]
    pub enriched: bool,
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub by: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignBody {
    pub assignee: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/approvals - Create an approval request.
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateApprovalRequest>,
) -> Result<Json<Approval>, AppError> {
    let approval = state.approvals.create(body).await?;
    Ok(Json(approval))
}

/// GET /api/approvals - List approvals with filters and pagination.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListApprovalsQuery>,
) -> Result<Json<ApprovalPage>, AppError> {
    let status: Vec<ApprovalStatus> = match &query.status {
        Some(raw) => raw
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                serde_json::from_value(serde_json::Value::String(s.trim().to_string()))
                    .map_err(|_| AppError::Validation(format!("invalid status: '{s}'")))
            })
            .collect::<Result<_, _>>()?,
        None => Vec::new(),
    };

    let filter = ApprovalFilter {
        project_id: query.project_id,
        status,
        risk_level: query.risk_level,
        search: query.search,
    };
    let page = state.approvals.list(&filter, query.page, query.page_size).await?;
    Ok(Json(page))
}

/// GET /api/approvals/:id - Fetch one approval; `?enriched=true` attaches
/// the waiting thread's status and step task.
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<GetApprovalQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let approval = state.approvals.get(id).await?;

    if !query.enriched {
        return Ok(Json(serde_json::to_value(&approval).unwrap_or_default()));
    }

    let thread = state.registry.get(&approval.thread_id).await?;
    let context = thread.map(|thread| {
        let step = thread.step(&approval.step_id);
        json!({
            "threadStatus": thread.status,
            "stepTask": step.map(|s| s.task.clone()),
            "stepStatus": thread.status_of(&approval.step_id),
        })
    });

    let mut body = serde_json::to_value(&approval).unwrap_or_default();
    body["threadContext"] = context.unwrap_or(serde_json::Value::Null);
    Ok(Json(body))
}

/// POST /api/approvals/:id/decide - Resolve a pending approval.
pub async fn decide(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ApprovalDecision>,
) -> Result<Json<Approval>, AppError> {
    let approval = state.approvals.decide(id, body).await?;
    Ok(Json(approval))
}

/// POST /api/approvals/:id/cancel - Cancel a pending approval.
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelBody>,
) -> Result<Json<Approval>, AppError> {
    let approval = state.approvals.cancel(id, &body.by).await?;
    Ok(Json(approval))
}

/// POST /api/approvals/:id/assign - Assign a pending approval.
pub async fn assign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<AssignBody>,
) -> Result<Json<Approval>, AppError> {
    let approval = state.approvals.assign(id, &body.assignee).await?;
    Ok(Json(approval))
}

/// POST /api/approvals/process-expired - Run the expiry sweep now.
pub async fn process_expired(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let expired = state.approvals.process_expired().await?;
    Ok(Json(json!({
        "expired": expired.len(),
        "approvalIds": expired.iter().map(|a| a.id.to_string()).collect::<Vec<_>>(),
    })))
}
