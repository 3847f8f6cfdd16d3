//! Agent management endpoints.

use axum::extract::{Extension, Path, State};
use axum::Json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::Agent;

use super::auth::AuthContext;
use super::{ApiError, AppState};

pub async fn list_agents(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<Agent>>, ApiError> {
    Ok(Json(state.store.list_agents(auth.org_id).await?))
}

async fn org_scoped_agent(
    state: &AppState,
    org_id: Uuid,
    agent_id: Uuid,
) -> Result<Agent, ApiError> {
    state
        .store
        .get_agent(agent_id)
        .await?
        .filter(|agent| agent.org_id == org_id)
        .ok_or_else(|| ApiError::not_found(format!("Agent {} not found", agent_id)))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(org_scoped_agent(&state, auth.org_id, id).await?))
}

pub async fn delete_agent(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    org_scoped_agent(&state, auth.org_id, id).await?;

    if let Err(e) = state.schedules.pause_agent_schedules(id).await {
        warn!(agent_id = %id, error = %e, "Could not pause schedules for deleted agent");
    }
    state.store.delete_agent(id).await?;
    info!(agent_id = %id, "Agent deleted");
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// User-initiated reconnect: one synchronous ping with the long timeout,
/// then schedule resumption on success.
pub async fn reconnect_agent(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    org_scoped_agent(&state, auth.org_id, id).await?;

    let revived = state.health.reconnect(id).await?;
    if !revived {
        return Err(ApiError::conflict("agent did not answer the ping"));
    }

    if let Err(e) = state.schedules.ensure_agent_schedules(id).await {
        warn!(agent_id = %id, error = %e, "Could not ensure schedules on reconnect");
    }
    if let Err(e) = state.schedules.resume_agent_schedules(id).await {
        warn!(agent_id = %id, error = %e, "Could not resume schedules on reconnect");
    }

    Ok(Json(serde_json::json!({ "reconnected": true })))
}
