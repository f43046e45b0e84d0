//! Operator JWTs (HS256) carrying a subject and a role.

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::gateway::session::Identity;

/// Operator roles, lowest privilege first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Operator,
    Admin,
    SuperAdmin,
}

impl Role {
    /// Whether this role meets or exceeds `required`.
    pub fn at_least(self, required: Role) -> bool {
        self >= required
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// HMAC key pair for signing and verifying operator tokens.
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtKeys {
    pub fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Check signature and expiry, returning who the token speaks for.
    pub fn verify(&self, token: &str) -> Result<Identity, ApiError> {
        let data =
            jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
                tracing::debug!(?e, "JWT validation failed");
                ApiError::unauthorized("Invalid or expired token")
            })?;

        Ok(Identity {
            subject: data.claims.sub,
            role: data.claims.role,
        })
    }

    pub fn issue(&self, subject: &str, role: Role, ttl: Duration) -> Result<String, ApiError> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            role,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(|e| {
            tracing::error!(?e, "failed to sign token");
            ApiError::internal("Token signing failed")
        })
    }
}
