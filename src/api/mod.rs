//! HTTP surface: the REST façade over jobs, queues, and agents, plus the
//! agent-facing registration and stream endpoints.

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::dispatch::{Dispatcher, HealthChecker};
use crate::engine::Schedules;
use crate::error::{DispatchError, RegistryError, TransitionError};
use crate::metrics;
use crate::registry::AgentRegistry;
use crate::store::{JobStore, StoreError};
use crate::stream::{LogNotifier, StreamManager};

pub mod agents;
pub mod auth;
pub mod jobs;
pub mod queues;
pub mod ws;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub streams: Arc<StreamManager>,
    pub notifier: Arc<LogNotifier>,
    pub registry: Arc<AgentRegistry>,
    pub health: Arc<HealthChecker>,
    pub dispatcher: Arc<Dispatcher>,
    pub schedules: Arc<dyn Schedules>,
    pub config: OrchestratorConfig,
}

/// Errors rendered as `{"error": …}` with a matching status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match &error {
            StoreError::JobNotFound(_) | StoreError::AgentNotFound(_) => {
                Self::not_found(error.to_string())
            }
            StoreError::NotQueued(_) => Self::bad_request(error.to_string()),
            StoreError::Conflict(_) => Self::conflict(error.to_string()),
            _ => Self::internal(error.to_string()),
        }
    }
}

impl From<TransitionError> for ApiError {
    fn from(error: TransitionError) -> Self {
        match &error {
            TransitionError::JobNotFound(_) => Self::not_found(error.to_string()),
            TransitionError::InvalidTransition { .. }
            | TransitionError::NotQueued(_)
            | TransitionError::AlreadyArchived(_) => Self::bad_request(error.to_string()),
            TransitionError::Store(inner) => match inner {
                StoreError::JobNotFound(_) => Self::not_found(error.to_string()),
                StoreError::NotQueued(_) => Self::bad_request(error.to_string()),
                _ => Self::internal(error.to_string()),
            },
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        match &error {
            RegistryError::InvalidCredentials => Self::unauthorized(error.to_string()),
            RegistryError::Store(_) => Self::internal(error.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        match &error {
            DispatchError::AgentNotFound(_) | DispatchError::JobNotFound(_) => {
                Self::not_found(error.to_string())
            }
            DispatchError::AlreadyStarted(_) => Self::conflict(error.to_string()),
            DispatchError::Store(_) => Self::internal(error.to_string()),
        }
    }
}

/// Builds the full router: authenticated REST routes plus the open
/// agent-facing endpoints.
pub fn build_router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route(
            "/jobs/{id}",
            get(jobs::get_job)
                .put(jobs::update_job)
                .delete(jobs::archive_job),
        )
        .route("/jobs/{id}/execute", post(jobs::execute_job))
        .route("/jobs/{id}/reprioritize", post(jobs::reprioritize_job))
        .route("/jobs/{id}/logs", get(jobs::job_logs))
        .route("/jobs/{id}/activities", get(jobs::job_activities))
        .route("/queues/{queue_type}/pause", post(queues::pause_queue))
        .route("/queues/{queue_type}/resume", post(queues::resume_queue))
        .route("/queues/{queue_type}/status", get(queues::queue_status))
        .route("/agents", get(agents::list_agents))
        .route(
            "/agents/{id}",
            get(agents::get_agent).delete(agents::delete_agent),
        )
        .route("/agents/{id}/reconnect", post(agents::reconnect_agent))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    let open = Router::new()
        .route("/agents/register", post(ws::register_agent))
        .route("/agents/stream", get(ws::agent_stream))
        .route("/metrics", get(metrics_endpoint))
        .route("/healthz", get(healthz));

    Router::new()
        .merge(authed)
        .merge(open)
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(state)
}

async fn metrics_endpoint() -> String {
    metrics::gather_metrics()
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Serves the router until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = state.config.listen_addr.clone();
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_store_errors_map_to_statuses() {
        let id = Uuid::new_v4();
        assert_eq!(
            ApiError::from(StoreError::JobNotFound(id)).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(StoreError::NotQueued(id)).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(StoreError::Conflict("positions moved".to_string())).status,
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_transition_errors_map_to_statuses() {
        let id = Uuid::new_v4();
        assert_eq!(
            ApiError::from(TransitionError::InvalidTransition {
                from: "queued".to_string(),
                to: "in-progress".to_string(),
                reason: "engine only".to_string(),
            })
            .status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(TransitionError::JobNotFound(id)).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(TransitionError::AlreadyArchived(id)).status,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_invalid_credentials_is_unauthorized() {
        assert_eq!(
            ApiError::from(RegistryError::InvalidCredentials).status,
            StatusCode::UNAUTHORIZED
        );
    }
}
