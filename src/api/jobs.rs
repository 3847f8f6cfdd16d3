//! Job endpoints: CRUD, orchestrated update, manual dispatch, and
//! reprioritization.

use std::sync::Arc;

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::dispatch::transitions;
use crate::model::{
    AcceptanceStatus, AgentStatus, Job, JobStatus, Priority, QueueType, UserInput,
};

use super::auth::AuthContext;
use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub prompt: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

pub async fn create_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt must not be empty"));
    }
    let input = UserInput::new(
        request.source.unwrap_or_else(|| "api".to_string()),
        request.prompt,
    );
    let job = transitions::create_job(
        state.store.as_ref(),
        auth.org_id,
        input,
        request.repo_id,
        request.priority,
        &auth.user_id,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.store.list_jobs(auth.org_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct GetJobQuery {
    #[serde(default)]
    pub version: Option<u32>,
}

pub async fn get_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Query(query): Query<GetJobQuery>,
) -> Result<Json<Job>, ApiError> {
    let job = match query.version {
        Some(version) => state.store.job_version(auth.org_id, id, version).await?,
        None => state.store.latest(auth.org_id, id).await?,
    };
    job.map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Job {} not found", id)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateJobRequest {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub queue_type: Option<QueueType>,
    #[serde(default)]
    pub user_acceptance_status: Option<AcceptanceStatus>,
    #[serde(default)]
    pub user_comments: Option<Vec<String>>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

pub async fn update_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateJobRequest>,
) -> Result<Json<Job>, ApiError> {
    let update = transitions::JobUpdate {
        status: request.status,
        queue_type: request.queue_type,
        user_acceptance_status: request.user_acceptance_status,
        user_comments: request.user_comments,
        prompt: request.prompt,
        repo_id: request.repo_id,
        priority: request.priority,
    };
    let job = transitions::apply_job_update(
        state.store.as_ref(),
        auth.org_id,
        id,
        update,
        &auth.user_id,
    )
    .await?;
    Ok(Json(job))
}

pub async fn archive_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = transitions::archive(state.store.as_ref(), auth.org_id, id, &auth.user_id).await?;
    Ok(Json(job))
}

/// Manual dispatch: dequeue the job and run it on an available agent now,
/// without waiting for the next scheduled firing.
pub async fn execute_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let (job, queue) =
        transitions::prepare_manual_execute(state.store.as_ref(), auth.org_id, id, &auth.user_id)
            .await?;

    // Any active agent without a running job will do.
    let mut chosen = None;
    for agent in state.store.list_agents(auth.org_id).await? {
        if agent.status != AgentStatus::Active {
            continue;
        }
        if state
            .store
            .in_progress_for_agent(auth.org_id, agent.id)
            .await?
            .is_none()
        {
            chosen = Some(agent);
            break;
        }
    }
    let Some(agent) = chosen else {
        // Put the job back where it came from rather than stranding it.
        state
            .store
            .enqueue_at_tail(auth.org_id, job.id, queue)
            .await?;
        return Err(ApiError::conflict("no available agent"));
    };

    let mut claimed = state
        .store
        .latest(auth.org_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Job {} not found", id)))?;
    claimed.status = JobStatus::InProgress;
    claimed.agent_id = Some(agent.id);
    claimed.updated_at = chrono::Utc::now();
    state.store.update_latest(&claimed).await?;

    info!(job_id = %id, agent_id = %agent.id, "Manual dispatch accepted");

    let dispatcher = Arc::clone(&state.dispatcher);
    let org_id = auth.org_id;
    let agent_id = agent.id;
    tokio::spawn(async move {
        dispatcher.execute_child(id, org_id, queue, agent_id).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "job_id": id, "agent_id": agent.id })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ReprioritizeRequest {
    pub position: i64,
}

pub async fn reprioritize_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(request): Json<ReprioritizeRequest>,
) -> Result<Json<Job>, ApiError> {
    if request.position < 0 {
        return Err(ApiError::bad_request("position must be non-negative"));
    }
    let job = transitions::reprioritize(
        state.store.as_ref(),
        auth.org_id,
        id,
        request.position,
        &auth.user_id,
    )
    .await?;
    Ok(Json(job))
}

pub async fn job_logs(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Query(query): Query<GetJobQuery>,
) -> Result<Json<Vec<crate::model::JobLogEntry>>, ApiError> {
    let version = match query.version {
        Some(version) => version,
        None => {
            state
                .store
                .latest(auth.org_id, id)
                .await?
                .ok_or_else(|| ApiError::not_found(format!("Job {} not found", id)))?
                .version
        }
    };
    Ok(Json(state.store.job_logs(auth.org_id, id, version).await?))
}

pub async fn job_activities(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<crate::model::Activity>>, ApiError> {
    Ok(Json(
        state.store.activities_for_job(auth.org_id, id).await?,
    ))
}
