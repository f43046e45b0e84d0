//! Hub observability and administrative session control.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};

use crate::auth::middleware::AuthUser;
use crate::auth::tokens::Role;
use crate::error::{ApiError, ApiErrorBody};
use crate::gateway::hub::HubStats;
use crate::gateway::session::SessionInfo;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{session_id}", delete(disconnect_session))
}

#[utoipa::path(
    get,
    path = "/api/v1/stats",
    tag = "Sessions",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Point-in-time hub counters", body = HubStats),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn get_stats(_user: AuthUser, State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats())
}

#[utoipa::path(
    get,
    path = "/api/v1/sessions",
    tag = "Sessions",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Connected sessions", body = Vec<SessionInfo>),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Admin role required", body = ApiErrorBody),
    ),
)]
pub async fn list_sessions(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionInfo>>, ApiError> {
    user.require(Role::Admin)?;
    let mut sessions = state.hub.sessions().await?;
    sessions.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
    Ok(Json(sessions))
}

#[utoipa::path(
    delete,
    path = "/api/v1/sessions/{session_id}",
    tag = "Sessions",
    security(("bearer" = [])),
    params(("session_id" = String, Path, description = "Session ID")),
    responses(
        (status = 204, description = "Session disconnected"),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Admin role required", body = ApiErrorBody),
        (status = 404, description = "Session not found", body = ApiErrorBody),
    ),
)]
pub async fn disconnect_session(
    user: AuthUser,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    user.require(Role::Admin)?;
    if !state.hub.disconnect(&session_id).await? {
        return Err(ApiError::not_found("Session not found"));
    }

    tracing::info!(%session_id, by = %user.subject, "session disconnected by admin");
    Ok(StatusCode::NO_CONTENT)
}
