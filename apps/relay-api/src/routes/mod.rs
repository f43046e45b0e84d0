pub mod events;
pub mod health;
pub mod sessions;

use axum::Router;
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest("/api/v1", events::router().merge(sessions::router()))
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        // Events
        events::publish_event,
        // Sessions
        sessions::get_stats,
        sessions::list_sessions,
        sessions::disconnect_session,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::error::FieldError,
            // Hub types
            crate::auth::tokens::Role,
            crate::gateway::hub::HubStats,
            crate::gateway::session::SessionInfo,
            crate::gateway::session::SessionState,
            // Route request/response types
            health::HealthResponse,
            events::PublishRequest,
            events::PublishResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Events", description = "Event publishing"),
        (name = "Sessions", description = "Connected sessions and hub stats"),
    )
)]
pub struct ApiDoc;
