//! Axum router configuration with middleware.
//!
//! Workflow endpoints live under `/api/`; the WebSocket event channel at
//! `/ws/events`. Middleware: CORS and request tracing.

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Invocation
        .route("/invoke", post(handlers::invoke::invoke))
        .route("/invoke/status/{thread_id}", post(handlers::invoke::status))
        .route("/workflow-graph/{thread_id}", get(handlers::invoke::graph))
        // Thread registry
        .route("/workflows", get(handlers::workflow::list_threads))
        .route("/workflows/{thread_id}", delete(handlers::workflow::delete_thread))
        .route("/workflows/{thread_id}/abort", post(handlers::workflow::abort_thread))
        // Approvals
        .route("/approvals", post(handlers::approval::create))
        .route("/approvals", get(handlers::approval::list))
        .route("/approvals/process-expired", post(handlers::approval::process_expired))
        .route("/approvals/{id}", get(handlers::approval::get))
        .route("/approvals/{id}/decide", post(handlers::approval::decide))
        .route("/approvals/{id}/cancel", post(handlers::approval::cancel))
        .route("/approvals/{id}/assign", post(handlers::approval::assign));

    Router::new()
        .nest("/api", api_routes)
        .route("/health", get(health_check))
        // WebSocket for real-time progress events; outside /api since it is
        // not a REST endpoint.
        .route("/ws/events", get(handlers::ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
