//! Bearer-token authentication for the REST surface.
//!
//! Tokens are stored hashed; a hit resolves to `{user_id, org_id}` and
//! every downstream handler scopes its queries by that org.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::registry::hash_secret;

use super::{ApiError, AppState};

/// The authenticated caller, injected into request extensions.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub org_id: Uuid,
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(token) = token else {
        return ApiError::unauthorized("Missing Authorization header. Use: Bearer <token>")
            .into_response();
    };

    match state.store.resolve_user_token(&hash_secret(&token)).await {
        Ok(Some((user_id, org_id))) => {
            req.extensions_mut().insert(AuthContext { user_id, org_id });
            next.run(req).await
        }
        Ok(None) => ApiError::unauthorized("Invalid token").into_response(),
        Err(e) => ApiError::internal(e.to_string()).into_response(),
    }
}
