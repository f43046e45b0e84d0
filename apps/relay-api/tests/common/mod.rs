#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use relay_api::auth::tokens::{JwtKeys, Role};
use relay_api::config::Config;
use relay_api::gateway::hub::{Hub, HubConfig};
use relay_api::AppState;

pub const TEST_SECRET: &str = "test-secret-do-not-use-in-production";

pub fn test_config() -> Config {
    Config {
        jwt_secret: TEST_SECRET.to_string(),
        port: 0,
        queue_capacity: 16,
        command_buffer: 64,
        pong_wait_secs: 60,
        write_wait_secs: 10,
        max_message_bytes: 512,
    }
}

/// Build a test AppState with a freshly spawned hub.
pub fn test_state() -> AppState {
    let config = test_config();
    let hub_config = config.hub_config().expect("valid test config");
    test_state_with(config, hub_config)
}

pub fn test_state_with(config: Config, hub_config: HubConfig) -> AppState {
    AppState {
        hub: Hub::spawn(hub_config),
        keys: Arc::new(JwtKeys::from_secret(&config.jwt_secret)),
        config: Arc::new(config),
    }
}

/// Build the full application router wired to the test state.
pub fn test_app() -> (Router, AppState) {
    let state = test_state();
    let app = relay_api::routes::router().with_state(state.clone());
    (app, state)
}

/// Mint a token for `subject` signed with the test secret.
pub fn mint_token(state: &AppState, subject: &str, role: Role) -> String {
    state
        .keys
        .issue(subject, role, chrono::Duration::minutes(5))
        .expect("mint test token")
}

/// Poll until `condition` holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}
