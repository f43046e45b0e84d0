use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::gateway::hub::HubConfig;
use crate::gateway::liveness::LivenessConfig;

/// Relay API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HMAC secret used to verify operator JWTs.
    pub jwt_secret: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Outbound queue capacity per session.
    pub queue_capacity: usize,
    /// Capacity of the hub's command queue (publishes waiting for fan-out).
    pub command_buffer: usize,
    /// Idle window after which a silent session is reaped.
    pub pong_wait_secs: u64,
    /// Deadline for a single write to a client.
    pub write_wait_secs: u64,
    /// Largest inbound frame a client may send.
    pub max_message_bytes: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            jwt_secret: required_var("JWT_SECRET"),
            port: parsed_var("PORT", 4003),
            queue_capacity: parsed_var("QUEUE_CAPACITY", 256),
            command_buffer: parsed_var("COMMAND_BUFFER", 256),
            pong_wait_secs: parsed_var("PONG_WAIT_SECS", 60),
            write_wait_secs: parsed_var("WRITE_WAIT_SECS", 10),
            max_message_bytes: parsed_var("MAX_MESSAGE_BYTES", 512),
        }
    }

    /// Derive the hub settings, rejecting values the pumps cannot honor.
    pub fn hub_config(&self) -> Result<HubConfig, ConfigError> {
        let liveness = LivenessConfig::new(
            Duration::from_secs(self.pong_wait_secs),
            Duration::from_secs(self.write_wait_secs),
            self.max_message_bytes,
        )?;
        HubConfig::new(self.queue_capacity, self.command_buffer, liveness)
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
