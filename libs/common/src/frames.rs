//! Wire-format frames exchanged over the event socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Control frame types
// ---------------------------------------------------------------------------

pub const TYPE_SUBSCRIBE: &str = "subscribe";
pub const TYPE_UNSUBSCRIBE: &str = "unsubscribe";
pub const TYPE_PING: &str = "ping";

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// A message frame delivered to a client: `{"type", "data", "timestamp"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct ServerFrameRef<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a Value,
    timestamp: DateTime<Utc>,
}

impl ServerFrame {
    /// Encode a frame without taking ownership of the payload.
    pub fn encode(kind: &str, data: &Value, timestamp: DateTime<Utc>) -> serde_json::Result<String> {
        serde_json::to_string(&ServerFrameRef {
            kind,
            data,
            timestamp,
        })
    }

    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// A validated control frame sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Replace the subscription set.
    Subscribe(Vec<String>),
    /// Remove topics from the subscription set.
    Unsubscribe(Vec<String>),
    /// Application-level ping; answered with a `pong` frame.
    Ping,
    /// Any other `type`. Ignored by the server.
    Unknown(String),
}

/// Reasons a control frame is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed control frame: {0}")]
    Malformed(String),
    #[error("`{kind}` frame requires `data` to be a list of topic strings")]
    InvalidTopics { kind: &'static str },
    #[error("`{kind}` frame has an empty topic list")]
    EmptyTopics { kind: &'static str },
    #[error("`{kind}` frame contains a blank topic")]
    BlankTopic { kind: &'static str },
}

#[derive(Deserialize)]
struct RawControlFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl ControlFrame {
    /// Parse and validate inbound text.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: RawControlFrame =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

        match raw.kind.as_str() {
            TYPE_SUBSCRIBE => Ok(Self::Subscribe(topics(TYPE_SUBSCRIBE, raw.data)?)),
            TYPE_UNSUBSCRIBE => Ok(Self::Unsubscribe(topics(TYPE_UNSUBSCRIBE, raw.data)?)),
            TYPE_PING => Ok(Self::Ping),
            _ => Ok(Self::Unknown(raw.kind)),
        }
    }

    /// Encode the frame as a client would send it.
    pub fn to_text(&self) -> String {
        let value = match self {
            Self::Subscribe(topics) => serde_json::json!({ "type": TYPE_SUBSCRIBE, "data": topics }),
            Self::Unsubscribe(topics) => {
                serde_json::json!({ "type": TYPE_UNSUBSCRIBE, "data": topics })
            }
            Self::Ping => serde_json::json!({ "type": TYPE_PING }),
            Self::Unknown(kind) => serde_json::json!({ "type": kind }),
        };
        value.to_string()
    }
}

fn topics(kind: &'static str, data: Value) -> Result<Vec<String>, FrameError> {
    let topics: Vec<String> =
        serde_json::from_value(data).map_err(|_| FrameError::InvalidTopics { kind })?;
    if topics.is_empty() {
        return Err(FrameError::EmptyTopics { kind });
    }
    if topics.iter().any(|t| t.trim().is_empty()) {
        return Err(FrameError::BlankTopic { kind });
    }
    Ok(topics)
}
