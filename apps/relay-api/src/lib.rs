pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use auth::tokens::JwtKeys;
use config::Config;
use gateway::hub::Hub;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub keys: Arc<JwtKeys>,
    pub config: Arc<Config>,
}
