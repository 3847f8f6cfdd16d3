//! Queue pause/resume and status endpoints.

use axum::extract::{Extension, Path, State};
use axum::Json;
use tracing::info;

use crate::model::QueueType;

use super::auth::AuthContext;
use super::{ApiError, AppState};

fn parse_queue(raw: &str) -> Result<QueueType, ApiError> {
    raw.parse()
        .map_err(|e: String| ApiError::bad_request(e))
}

pub async fn pause_queue(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(queue_type): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let queue = parse_queue(&queue_type)?;
    state
        .store
        .set_queue_paused(auth.org_id, queue, true)
        .await?;
    info!(org_id = %auth.org_id, queue = %queue, "Queue paused");
    Ok(Json(serde_json::json!({ "is_paused": true })))
}

pub async fn resume_queue(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(queue_type): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let queue = parse_queue(&queue_type)?;
    state
        .store
        .set_queue_paused(auth.org_id, queue, false)
        .await?;
    info!(org_id = %auth.org_id, queue = %queue, "Queue resumed");
    Ok(Json(serde_json::json!({ "is_paused": false })))
}

pub async fn queue_status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(queue_type): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let queue = parse_queue(&queue_type)?;
    let is_paused = state.store.is_queue_paused(auth.org_id, queue).await?;
    let depth = state.store.next_position(auth.org_id, queue).await?;
    Ok(Json(serde_json::json!({
        "is_paused": is_paused,
        "depth": depth,
    })))
}
