//! The hub: a single task that owns the session registry.
//!
//! Register, unregister, and broadcast all travel through one command queue
//! and are applied in order by the hub loop, so fan-out never observes the
//! registry mid-mutation. `stats()` reads atomics and never touches the loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use utoipa::ToSchema;

use crate::error::{ConfigError, HubError};

use super::envelope::{Envelope, Outbound};
use super::liveness::LivenessConfig;
use super::session::{CloseReason, EnqueueOutcome, Identity, Session, SessionInfo};

/// Default outbound queue capacity per session.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default capacity of the hub's command queue.
pub const DEFAULT_COMMAND_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    queue_capacity: usize,
    command_buffer: usize,
    liveness: LivenessConfig,
}

impl HubConfig {
    pub fn new(
        queue_capacity: usize,
        command_buffer: usize,
        liveness: LivenessConfig,
    ) -> Result<Self, ConfigError> {
        if queue_capacity == 0 {
            return Err(ConfigError::Zero {
                name: "queue capacity",
            });
        }
        if command_buffer == 0 {
            return Err(ConfigError::Zero {
                name: "command buffer",
            });
        }
        Ok(Self {
            queue_capacity,
            command_buffer,
            liveness,
        })
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn command_buffer(&self) -> usize {
        self.command_buffer
    }

    pub fn liveness(&self) -> &LivenessConfig {
        &self.liveness
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            liveness: LivenessConfig::default(),
        }
    }
}

/// Point-in-time hub counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct HubStats {
    pub connected_clients: usize,
    /// Publishes accepted but not yet fanned out.
    pub pending_broadcast_depth: usize,
    pub published_total: u64,
    /// Envelopes discarded because a session's queue was full.
    pub dropped_total: u64,
    /// Publishes refused because the command queue was full.
    pub rejected_total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Queued,
    /// The command queue was full; the event was discarded.
    Dropped,
    /// The hub has shut down.
    Closed,
}

#[derive(Default)]
struct Counters {
    connected: AtomicUsize,
    pending: AtomicUsize,
    published: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

struct PublishRequest {
    kind: String,
    topic: String,
    payload: Value,
}

enum Command {
    Register {
        session: Arc<Session>,
        reply: oneshot::Sender<()>,
    },
    Unregister {
        session_id: String,
        reply: oneshot::Sender<bool>,
    },
    Publish(PublishRequest),
    Disconnect {
        session_id: String,
        reply: oneshot::Sender<bool>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the hub loop. Store in `AppState`.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
    counters: Arc<Counters>,
    config: Arc<HubConfig>,
}

impl Hub {
    /// Start the hub loop on the current runtime.
    pub fn spawn(config: HubConfig) -> Self {
        let (commands, rx) = mpsc::channel(config.command_buffer);
        let counters = Arc::new(Counters::default());

        let hub_loop = HubLoop {
            registry: HashMap::new(),
            counters: counters.clone(),
            next_seq: 0,
            // Close frame and sink flush are each bounded by the write wait.
            drain_timeout: config.liveness.write_wait() * 2,
        };
        tokio::spawn(hub_loop.run(rx));

        Self {
            commands,
            counters,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Build a session sized for this hub. It is not registered yet.
    pub fn new_session(&self, identity: Identity) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        Session::new(identity, self.config.queue_capacity)
    }

    /// Insert into the registry. Every publish issued after this returns
    /// considers the session.
    pub async fn register(&self, session: Arc<Session>) -> Result<(), HubError> {
        self.request(|reply| Command::Register { session, reply })
            .await
    }

    /// Remove from the registry. Returns `false` if it was already gone.
    pub async fn unregister(&self, session_id: &str) -> Result<bool, HubError> {
        let session_id = session_id.to_string();
        self.request(|reply| Command::Unregister { session_id, reply })
            .await
    }

    /// Queue an event for fan-out. Never waits: a full command queue drops it.
    pub fn publish(
        &self,
        kind: impl Into<String>,
        topic: impl Into<String>,
        payload: Value,
    ) -> PublishOutcome {
        let request = PublishRequest {
            kind: kind.into(),
            topic: topic.into(),
            payload,
        };

        self.counters.pending.fetch_add(1, Ordering::Relaxed);
        match self.commands.try_send(Command::Publish(request)) {
            Ok(()) => PublishOutcome::Queued,
            Err(TrySendError::Full(Command::Publish(request))) => {
                self.counters.pending.fetch_sub(1, Ordering::Relaxed);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    kind = %request.kind,
                    topic = %request.topic,
                    "broadcast queue full, dropping event"
                );
                PublishOutcome::Dropped
            }
            Err(_) => {
                self.counters.pending.fetch_sub(1, Ordering::Relaxed);
                tracing::debug!("publish after hub shutdown");
                PublishOutcome::Closed
            }
        }
    }

    /// Administrative close. Returns `false` for an unknown session id.
    pub async fn disconnect(&self, session_id: &str) -> Result<bool, HubError> {
        let session_id = session_id.to_string();
        self.request(|reply| Command::Disconnect { session_id, reply })
            .await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, HubError> {
        self.request(|reply| Command::Sessions { reply }).await
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connected_clients: self.counters.connected.load(Ordering::Relaxed),
            pending_broadcast_depth: self.counters.pending.load(Ordering::Relaxed),
            published_total: self.counters.published.load(Ordering::Relaxed),
            dropped_total: self.counters.dropped.load(Ordering::Relaxed),
            rejected_total: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Close every session and stop the loop. Returns once every session with
    /// running pumps has reached `Closed`, or the drain deadline has passed.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HubError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }
}

struct HubLoop {
    registry: HashMap<String, Arc<Session>>,
    counters: Arc<Counters>,
    next_seq: u64,
    drain_timeout: Duration,
}

impl HubLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut shutdown = None;
        let mut draining = Vec::new();

        while let Some(command) = commands.recv().await {
            match command {
                Command::Register { session, reply } => {
                    session.mark_registered();
                    tracing::info!(
                        session_id = %session.id(),
                        subject = %session.identity().subject,
                        "session registered"
                    );
                    self.registry.insert(session.id().to_string(), session);
                    self.sync_connected();
                    let _ = reply.send(());
                }
                Command::Unregister { session_id, reply } => {
                    let removed = self.remove(&session_id, CloseReason::Unregistered);
                    let _ = reply.send(removed);
                }
                Command::Publish(request) => {
                    self.counters.pending.fetch_sub(1, Ordering::Relaxed);
                    self.broadcast(request);
                }
                Command::Disconnect { session_id, reply } => {
                    let removed = self.remove(&session_id, CloseReason::AdminDisconnect);
                    let _ = reply.send(removed);
                }
                Command::Sessions { reply } => {
                    let _ = reply.send(self.registry.values().map(|s| s.info()).collect());
                }
                Command::Shutdown { reply } => {
                    tracing::info!(sessions = self.registry.len(), "hub shutting down");
                    for (_, session) in self.registry.drain() {
                        session.close(CloseReason::HubShutdown);
                        if session.has_pumps() {
                            draining.push(session.finished());
                        }
                    }
                    self.sync_connected();
                    shutdown = Some(reply);
                    break;
                }
            }
        }

        // Anything still queued is discarded; waiting callers see `Closed`.
        // Closing first lets exiting pumps fail their unregister right away.
        commands.close();
        while let Some(command) = commands.recv().await {
            if let Command::Publish(_) = command {
                self.counters.pending.fetch_sub(1, Ordering::Relaxed);
            }
        }

        if let Some(reply) = shutdown {
            let pending = draining.len();
            if time::timeout(self.drain_timeout, future::join_all(draining))
                .await
                .is_err()
            {
                tracing::warn!(
                    sessions = pending,
                    timeout = ?self.drain_timeout,
                    "sessions still closing after shutdown deadline"
                );
            }
            let _ = reply.send(());
        }
    }

    fn remove(&mut self, session_id: &str, reason: CloseReason) -> bool {
        let Some(session) = self.registry.remove(session_id) else {
            return false;
        };
        session.close(reason);
        self.sync_connected();
        tracing::info!(
            session_id = %session_id,
            subject = %session.identity().subject,
            reason = ?session.close_reason(),
            "session unregistered"
        );
        true
    }

    fn broadcast(&mut self, request: PublishRequest) {
        self.next_seq += 1;
        let envelope = match Envelope::stamp(
            self.next_seq,
            request.kind,
            request.topic,
            request.payload,
            Utc::now(),
        ) {
            Ok(envelope) => Arc::new(envelope),
            Err(e) => {
                tracing::error!(?e, "failed to encode event frame");
                return;
            }
        };
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0usize;
        let mut dropped = 0u64;
        for session in self.registry.values() {
            if !session.wants(&envelope) {
                continue;
            }
            match session.enqueue(Outbound::Event(envelope.clone())) {
                EnqueueOutcome::Queued => delivered += 1,
                EnqueueOutcome::Dropped => {
                    dropped += 1;
                    tracing::debug!(
                        session_id = %session.id(),
                        seq = envelope.seq(),
                        "outbound queue full, event dropped"
                    );
                }
                EnqueueOutcome::Closed => {}
            }
        }

        if dropped > 0 {
            self.counters.dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        tracing::trace!(
            seq = envelope.seq(),
            kind = %envelope.kind(),
            topic = %envelope.topic(),
            delivered,
            dropped,
            "event fanned out"
        );
    }

    fn sync_connected(&self) {
        self.counters
            .connected
            .store(self.registry.len(), Ordering::Relaxed);
    }
}
