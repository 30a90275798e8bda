//! Thread registry endpoints: listing, deletion, abort.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use studio_core::repository::workflow::ThreadFilter;
use studio_types::workflow::{ThreadStatus, ThreadSummary};

use crate::http::error::AppError;
use crate::state::AppState;

/// Query parameters for listing threads.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListThreadsQuery {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub status: Option<ThreadStatus>,
}

/// GET /api/workflows - List thread summaries.
pub async fn list_threads(
    State(state): State<AppState>,
    Query(query): Query<ListThreadsQuery>,
) -> Result<Json<Vec<ThreadSummary>>, AppError> {
    let filter = ThreadFilter { project_id: query.project_id, status: query.status };
    let summaries = state.registry.list(&filter).await?;
    Ok(Json(summaries))
}

/// DELETE /api/workflows/:threadId - Delete a thread (cascades to the store).
pub async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let deleted = state.registry.delete(&thread_id).await?;
    if !deleted {
        return Err(AppError::NotFound(format!("unknown thread: {thread_id}")));
    }
    Ok(Json(json!({"deleted": true, "threadId": thread_id})))
}

/// POST /api/workflows/:threadId/abort - Abort a live thread.
pub async fn abort_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let aborted = state.orchestrator.abort(&thread_id);
    if !aborted {
        return Err(AppError::NotFound(format!(
            "thread '{thread_id}' has no live worker"
        )));
    }
    Ok(Json(json!({"threadId": thread_id, "aborting": true})))
}
