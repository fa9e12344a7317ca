//! Administrative HTTP surface.
//!
//! The push-task CRUD routes are placeholders; only `/metrics` does real
//! work.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/tasks/push/", post(create_push_task))
        .route(
            "/tasks/push/:id",
            get(get_push_task).put(modify_push_task).delete(delete_push_task),
        )
        .route("/metrics", get(metrics))
        .with_state(registry)
}

/// Create a new push task. Placeholder.
async fn create_push_task() -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}

/// Fetch a push task. Placeholder.
async fn get_push_task(Path(_id): Path<String>) -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}

/// Modify a push task. Placeholder.
async fn modify_push_task(Path(_id): Path<String>) -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}

/// Delete a push task. Placeholder.
async fn delete_push_task(Path(_id): Path<String>) -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}

async fn metrics(State(registry): State<Arc<Registry>>) -> Result<String, StatusCode> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
