//! Per-connection session state.
//!
//! A session is shared between the hub (registry and fan-out) and its two
//! pumps. Only the pumps touch the connection; the hub only enqueues.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use relay_common::events::Topic;
use relay_common::id::{prefix, PrefixedId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use utoipa::ToSchema;

use crate::auth::tokens::Role;

use super::envelope::{Envelope, Outbound};

/// Number of recent enqueue outcomes used to decide whether a session is degraded.
const DEGRADED_WINDOW: usize = 32;

/// Close codes sent to the peer (4000-range for application-level).
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_TOO_LARGE: u16 = 1009;
const CLOSE_LIVENESS_TIMEOUT: u16 = 4009;
const CLOSE_ADMIN_DISCONNECT: u16 = 4010;

/// Who is on the other end, as established by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Identity {
    pub subject: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Registered,
    Active,
    Degraded,
    Unregistering,
    Closed,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Registered => 1,
            Self::Active | Self::Degraded => 2,
            Self::Unregistering => 3,
            Self::Closed => 4,
        }
    }

    /// Forward-only, except that `Active` and `Degraded` flip freely.
    fn can_become(self, next: Self) -> bool {
        next.rank() > self.rank() || (self.rank() == 2 && next.rank() == 2)
    }
}

/// Why a session began closing. Only the first reason is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    PeerClosed,
    ReadFailed,
    WriteFailed,
    LivenessTimeout,
    MessageTooLarge,
    AdminDisconnect,
    HubShutdown,
    /// Removed from the hub without any other cause.
    Unregistered,
}

impl CloseReason {
    /// Code and reason text for the close frame sent to the peer.
    pub fn close_frame(self) -> (u16, &'static str) {
        match self {
            Self::PeerClosed => (CLOSE_NORMAL, "Closed by client"),
            Self::ReadFailed => (CLOSE_NORMAL, "Read failed"),
            Self::WriteFailed => (CLOSE_NORMAL, "Write failed"),
            Self::LivenessTimeout => (CLOSE_LIVENESS_TIMEOUT, "Liveness timeout"),
            Self::MessageTooLarge => (CLOSE_TOO_LARGE, "Message too large"),
            Self::AdminDisconnect => (CLOSE_ADMIN_DISCONNECT, "Disconnected by administrator"),
            Self::HubShutdown => (CLOSE_GOING_AWAY, "Server shutting down"),
            Self::Unregistered => (CLOSE_NORMAL, "Session ended"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queue was full; the new item was discarded.
    Dropped,
    /// Session is closing or its writer has gone.
    Closed,
}

/// Trailing record of enqueue outcomes (`true` = dropped).
#[derive(Debug, Default)]
struct DropWindow {
    outcomes: VecDeque<bool>,
    drops: usize,
}

impl DropWindow {
    /// Record one outcome and report whether any drop is still in the window.
    fn record(&mut self, dropped: bool) -> bool {
        self.outcomes.push_back(dropped);
        if dropped {
            self.drops += 1;
        }
        if self.outcomes.len() > DEGRADED_WINDOW && self.outcomes.pop_front() == Some(true) {
            self.drops -= 1;
        }
        self.drops > 0
    }

    fn has_drops(&self) -> bool {
        self.drops > 0
    }
}

/// Point-in-time view of a session for the admin listing.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionInfo {
    pub session_id: String,
    pub subject: String,
    pub role: Role,
    pub state: SessionState,
    pub subscriptions: Vec<String>,
    pub queue_len: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub connected_at: DateTime<Utc>,
}

/// State for a single client connection.
pub struct Session {
    id: String,
    identity: Identity,
    subscriptions: RwLock<HashSet<String>>,
    queue: mpsc::Sender<Outbound>,
    state: Mutex<SessionState>,
    drops: Mutex<DropWindow>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    close_reason: Mutex<Option<CloseReason>>,
    shutdown: watch::Sender<bool>,
    /// Set once both pumps have ended and the session is `Closed`.
    finished: watch::Sender<bool>,
    pumps_attached: AtomicBool,
    connected_at: DateTime<Utc>,
}

impl PrefixedId for Session {
    const PREFIX: &'static str = prefix::SESSION;
}

impl Session {
    /// Create a session in `Connecting` along with the receiving end of its
    /// outbound queue, which belongs to the writer pump.
    pub fn new(identity: Identity, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (queue, rx) = mpsc::channel(capacity);
        let (shutdown, _) = watch::channel(false);
        let (finished, _) = watch::channel(false);
        let session = Self {
            id: Self::generate(),
            identity,
            subscriptions: RwLock::new(HashSet::from([Topic::ALL.to_string()])),
            queue,
            state: Mutex::new(SessionState::Connecting),
            drops: Mutex::new(DropWindow::default()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            close_reason: Mutex::new(None),
            shutdown,
            finished,
            pumps_attached: AtomicBool::new(false),
            connected_at: Utc::now(),
        };
        (Arc::new(session), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn subscriptions(&self) -> HashSet<String> {
        self.subscriptions.read().clone()
    }

    /// Replace the subscription set.
    pub fn subscribe(&self, topics: Vec<String>) {
        *self.subscriptions.write() = topics.into_iter().collect();
    }

    /// Remove topics. Removing everything leaves the session receiving nothing.
    pub fn unsubscribe(&self, topics: &[String]) {
        let mut subs = self.subscriptions.write();
        for topic in topics {
            subs.remove(topic);
        }
    }

    pub fn wants(&self, envelope: &Envelope) -> bool {
        envelope.matches(&self.subscriptions.read())
    }

    /// Non-blocking hand-off to the writer pump. A full queue drops the new item.
    ///
    /// Only events count toward `delivered`, `dropped` and the degraded
    /// window; control replies such as pongs do not.
    pub fn enqueue(&self, item: Outbound) -> EnqueueOutcome {
        if self.is_closed() {
            return EnqueueOutcome::Closed;
        }

        let is_event = matches!(item, Outbound::Event(_));
        let outcome = match self.queue.try_send(item) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(TrySendError::Full(_)) => EnqueueOutcome::Dropped,
            Err(TrySendError::Closed(_)) => return EnqueueOutcome::Closed,
        };
        if !is_event {
            return outcome;
        }

        match outcome {
            EnqueueOutcome::Queued => self.delivered.fetch_add(1, Ordering::Relaxed),
            _ => self.dropped.fetch_add(1, Ordering::Relaxed),
        };
        let degraded = self.drops.lock().record(outcome == EnqueueOutcome::Dropped);
        self.refresh_degraded(degraded);
        outcome
    }

    fn refresh_degraded(&self, degraded: bool) {
        let mut state = self.state.lock();
        match (*state, degraded) {
            (SessionState::Active, true) => {
                *state = SessionState::Degraded;
                tracing::warn!(
                    session_id = %self.id,
                    subject = %self.identity.subject,
                    "session degraded: outbound queue full"
                );
            }
            (SessionState::Degraded, false) => {
                *state = SessionState::Active;
                tracing::info!(session_id = %self.id, "session recovered");
            }
            _ => {}
        }
    }

    /// Move to `next` if the state machine allows it.
    pub(crate) fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if state.can_become(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn mark_registered(&self) {
        self.transition(SessionState::Registered);
    }

    /// Pumps are running. Lands in `Degraded` if drops are already on record.
    pub(crate) fn mark_active(&self) {
        let next = if self.drops.lock().has_drops() {
            SessionState::Degraded
        } else {
            SessionState::Active
        };
        self.transition(next);
    }

    /// Both pumps have ended.
    pub(crate) fn mark_closed(&self) {
        self.transition(SessionState::Closed);
        self.finished.send_replace(true);
    }

    /// Record that pumps will drive this session, so shutdown waits for it.
    pub(crate) fn attach_pumps(&self) {
        self.pumps_attached.store(true, Ordering::Release);
    }

    pub fn has_pumps(&self) -> bool {
        self.pumps_attached.load(Ordering::Acquire)
    }

    /// Begin closing. Returns `true` only for the call that initiated it;
    /// later calls are no-ops.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.transition(SessionState::Unregistering);
        self.shutdown.send_replace(true);
        tracing::debug!(session_id = %self.id, ?reason, "session closing");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.lock().is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Resolves once `close` has been called. Each call gets its own receiver.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        flag_set(self.shutdown.subscribe())
    }

    /// Resolves once the session has reached `Closed`.
    pub fn finished(&self) -> impl Future<Output = ()> + Send + 'static {
        flag_set(self.finished.subscribe())
    }

    /// Items waiting for the writer pump.
    pub fn queue_len(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> SessionInfo {
        let mut subscriptions: Vec<String> = self.subscriptions().into_iter().collect();
        subscriptions.sort();
        SessionInfo {
            session_id: self.id.clone(),
            subject: self.identity.subject.clone(),
            role: self.identity.role,
            state: self.state(),
            subscriptions,
            queue_len: self.queue_len(),
            delivered: self.delivered(),
            dropped: self.dropped(),
            connected_at: self.connected_at,
        }
    }
}

async fn flag_set(mut rx: watch::Receiver<bool>) {
    loop {
        let done = *rx.borrow_and_update();
        if done || rx.changed().await.is_err() {
            return;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("subject", &self.identity.subject)
            .field("state", &self.state())
            .finish()
    }
}
