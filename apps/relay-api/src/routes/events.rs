//! Event publishing endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::auth::tokens::Role;
use crate::error::{ApiError, ApiErrorBody, FieldError};
use crate::gateway::hub::PublishOutcome;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/events", post(publish_event))
}

// ---------------------------------------------------------------------------
// POST /api/v1/events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct PublishRequest {
    /// Frame `type` delivered to clients, e.g. `params_updated`.
    pub kind: String,
    /// Subscription topic, e.g. `params`. `all` is reserved.
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PublishResponse {
    /// `false` when the broadcast queue was full and the event was dropped.
    pub queued: bool,
}

#[utoipa::path(
    post,
    path = "/api/v1/events",
    tag = "Events",
    security(("bearer" = [])),
    request_body = PublishRequest,
    responses(
        (status = 202, description = "Event accepted for broadcast", body = PublishResponse),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Operator role required", body = ApiErrorBody),
        (status = 503, description = "Hub is not running", body = ApiErrorBody),
    ),
)]
pub async fn publish_event(
    user: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    user.require(Role::Operator)?;
    validate(&body)?;

    let queued = match state.hub.publish(body.kind, body.topic, body.payload) {
        PublishOutcome::Queued => true,
        PublishOutcome::Dropped => false,
        PublishOutcome::Closed => return Err(ApiError::unavailable("Event hub is not running")),
    };

    Ok((StatusCode::ACCEPTED, Json(PublishResponse { queued })))
}

fn validate(body: &PublishRequest) -> Result<(), ApiError> {
    let mut errors = Vec::new();
    if body.kind.trim().is_empty() {
        errors.push(FieldError {
            field: "kind".to_string(),
            message: "must not be empty".to_string(),
        });
    }
    if body.topic.trim().is_empty() {
        errors.push(FieldError {
            field: "topic".to_string(),
            message: "must not be empty".to_string(),
        });
    } else if body.topic == relay_common::events::Topic::ALL {
        errors.push(FieldError {
            field: "topic".to_string(),
            message: "`all` is a subscription wildcard, not a topic".to_string(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::validation(errors))
    }
}
