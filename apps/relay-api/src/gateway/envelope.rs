//! The immutable unit the hub fans out to sessions.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use relay_common::events::Topic;
use relay_common::ServerFrame;
use serde_json::Value;

/// A published event, stamped by the hub.
///
/// The wire frame is encoded once when the envelope is built and shared by
/// every session that receives it.
#[derive(Debug)]
pub struct Envelope {
    seq: u64,
    kind: String,
    topic: String,
    payload: Value,
    produced_at: DateTime<Utc>,
    frame: Utf8Bytes,
}

impl Envelope {
    /// Stamp a new envelope. Only the hub loop assigns `seq` and `produced_at`.
    pub(crate) fn stamp(
        seq: u64,
        kind: String,
        topic: String,
        payload: Value,
        produced_at: DateTime<Utc>,
    ) -> serde_json::Result<Self> {
        let frame = ServerFrame::encode(&kind, &payload, produced_at)?;
        Ok(Self {
            seq,
            kind,
            topic,
            payload,
            produced_at,
            frame: frame.into(),
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }

    /// Encoded `{type, data, timestamp}` text. Cloning is a refcount bump.
    pub fn frame(&self) -> Utf8Bytes {
        self.frame.clone()
    }

    /// Exact topic or wildcard. No prefix matching.
    pub fn matches(&self, subscriptions: &HashSet<String>) -> bool {
        subscriptions.contains(Topic::ALL) || subscriptions.contains(self.topic.as_str())
    }
}

/// Items carried on a session's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Arc<Envelope>),
    /// Reply to a client `ping` control frame.
    Pong,
}
