//! Workflow invocation, status, and graph endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use studio_core::workflow::orchestrator::{InvokeRequest, InvokeResponse};
use studio_types::workflow::WorkflowStep;

use crate::http::error::AppError;
use crate::state::AppState;

/// Wire body for `POST /api/invoke`. `workflow` accepts a single step or a
/// list of steps.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeBody {
    pub workflow: OneOrMany,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub start_new_conversation: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(Box<WorkflowStep>),
    Many(Vec<WorkflowStep>),
}

impl From<OneOrMany> for Vec<WorkflowStep> {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(step) => vec![*step],
            OneOrMany::Many(steps) => steps,
        }
    }
}

/// POST /api/invoke - Run a workflow (or resume an existing thread).
pub async fn invoke(
    State(state): State<AppState>,
    Json(body): Json<InvokeBody>,
) -> Result<Json<InvokeResponse>, AppError> {
    let request = InvokeRequest {
        workflow: body.workflow.into(),
        project_id: body.project_id,
        thread_id: body.thread_id,
        start_new_conversation: body.start_new_conversation,
    };

    let response = state.orchestrator.invoke(request).await?;
    Ok(Json(response))
}

/// POST /api/invoke/status/:threadId - Current thread state projection.
pub async fn status(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<InvokeResponse>, AppError> {
    let response = state.orchestrator.status(&thread_id).await?;
    Ok(Json(response))
}

/// GET /api/workflow-graph/:threadId - Graph projection for visualization.
pub async fn graph(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let graph = state.registry.graph(&thread_id).await?;
    Ok(Json(json!({
        "threadId": graph.thread_id,
        "status": graph.status,
        "graph": {
            "nodes": graph.nodes,
            "edges": graph.edges,
        },
        "execution": graph.execution,
        "metadata": graph.metadata,
    })))
}
