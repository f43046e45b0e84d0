//! Request extractors for operator tokens.

use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use serde::Deserialize;

use crate::auth::tokens::Role;
use crate::error::ApiError;
use crate::gateway::session::Identity;
use crate::AppState;

/// Authenticated operator extracted from the `Authorization: Bearer <jwt>` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub subject: String,
    pub role: Role,
}

impl AuthUser {
    pub fn require(&self, required: Role) -> Result<(), ApiError> {
        if self.role.at_least(required) {
            Ok(())
        } else {
            Err(ApiError::forbidden("Insufficient role"))
        }
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("Missing Authorization header"))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("Invalid Authorization header format"))?;

        let identity = state.keys.verify(token)?;
        Ok(AuthUser {
            subject: identity.subject,
            role: identity.role,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Identity for a socket upgrade, taken from the `?token=` query parameter.
/// Browsers cannot set headers on a WebSocket handshake.
#[derive(Debug, Clone)]
pub struct SocketIdentity(pub Identity);

impl FromRequestParts<AppState> for SocketIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Query(query) = Query::<TokenQuery>::try_from_uri(&parts.uri)
            .map_err(|_| ApiError::unauthorized("Invalid query string"))?;
        let token = query
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::unauthorized("Missing token"))?;

        Ok(SocketIdentity(state.keys.verify(&token)?))
    }
}
