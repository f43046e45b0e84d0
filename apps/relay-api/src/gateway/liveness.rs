//! Keepalive timing shared by a session's reader and writer pumps.
//!
//! The writer sends a ping every `ping_period` regardless of traffic. The
//! reader reaps the session when nothing at all arrives within `pong_wait`.
//! The two deadlines are independent: a client that accepts every write but
//! never answers a ping is still reaped.

use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::error::ConfigError;

/// Time allowed to read the next frame (pong or otherwise) from the peer.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);

/// Time allowed to write a single frame to the peer.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Largest inbound frame accepted from a client.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 512;

/// Only built through [`LivenessConfig::new`] or `Default`, so every value
/// the pumps see has passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pong_wait: Duration,
    /// Always shorter than `pong_wait` so a healthy peer answers in time.
    ping_period: Duration,
    write_wait: Duration,
    max_message_bytes: usize,
}

impl LivenessConfig {
    /// Build a config with the ping period at nine tenths of `pong_wait`.
    pub fn new(
        pong_wait: Duration,
        write_wait: Duration,
        max_message_bytes: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait,
            max_message_bytes,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pong_wait.is_zero() {
            return Err(ConfigError::Zero { name: "pong wait" });
        }
        if self.ping_period.is_zero() {
            return Err(ConfigError::Zero { name: "ping period" });
        }
        if self.write_wait.is_zero() {
            return Err(ConfigError::Zero { name: "write wait" });
        }
        if self.max_message_bytes == 0 {
            return Err(ConfigError::Zero {
                name: "max message size",
            });
        }
        if self.ping_period >= self.pong_wait {
            return Err(ConfigError::PingOutlivesPong {
                ping: self.ping_period,
                pong: self.pong_wait,
            });
        }
        Ok(())
    }

    pub fn pong_wait(&self) -> Duration {
        self.pong_wait
    }

    pub fn ping_period(&self) -> Duration {
        self.ping_period
    }

    pub fn write_wait(&self) -> Duration {
        self.write_wait
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// Fixed-interval keepalive timer. The first tick fires one period from now.
    pub fn keepalive_ticker(&self) -> Interval {
        let mut ticker = time::interval_at(Instant::now() + self.ping_period, self.ping_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    pub fn read_deadline(&self) -> ReadDeadline {
        ReadDeadline::new(self.pong_wait)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            pong_wait: DEFAULT_PONG_WAIT,
            ping_period: DEFAULT_PONG_WAIT * 9 / 10,
            write_wait: DEFAULT_WRITE_WAIT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

/// Sliding idle deadline owned by the reader pump.
#[derive(Debug)]
pub struct ReadDeadline {
    window: Duration,
    deadline: Instant,
}

impl ReadDeadline {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: Instant::now() + window,
        }
    }

    /// Push the deadline out after any inbound traffic.
    pub fn touch(&mut self) {
        self.deadline = Instant::now() + self.window;
    }

    pub fn instant(&self) -> Instant {
        self.deadline
    }
}
