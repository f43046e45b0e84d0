//! Well-known event kinds and topics.
//!
//! Both are open strings on the wire. Publishers may use any kind or topic;
//! these constants only name the ones the control plane emits today.

/// Event kinds carried in the `type` field of a server frame.
pub struct EventKind;

impl EventKind {
    pub const BLOCK: &'static str = "block";
    pub const TRANSACTION: &'static str = "transaction";
    pub const EVENT: &'static str = "event";
    pub const DEX_SWAP: &'static str = "dex_swap";
    pub const ORACLE_PRICE: &'static str = "oracle_price";
    pub const PARAMS_UPDATED: &'static str = "params_updated";
    pub const CIRCUIT_BREAKER_TRIPPED: &'static str = "circuit_breaker_tripped";
    pub const CIRCUIT_BREAKER_CLOSED: &'static str = "circuit_breaker_closed";
    pub const EMERGENCY_ALERT: &'static str = "emergency_alert";
    pub const AUDIT: &'static str = "audit";
    /// Reply to a client `ping` control frame.
    pub const PONG: &'static str = "pong";
}

/// Subscription topics.
pub struct Topic;

impl Topic {
    /// Reserved wildcard: a session subscribed to it receives every topic.
    pub const ALL: &'static str = "all";
    pub const BLOCKS: &'static str = "blocks";
    pub const DEX: &'static str = "dex";
    pub const ORACLE: &'static str = "oracle";
    pub const PARAMS: &'static str = "params";
    pub const ALERTS: &'static str = "alerts";
    pub const AUDIT: &'static str = "audit";
}
