//! Reader and writer pumps: the only code that touches a client connection.
//!
//! Each session gets exactly one of each. The reader owns the inbound half
//! and the read deadline; the writer owns the outbound half, the outbound
//! queue, and the keepalive timer. Either one closing the session stops the
//! other, and `run_session` unregisters once both have returned.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes};
use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use relay_common::events::EventKind;
use relay_common::{ControlFrame, ServerFrame};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time;

use crate::error::HubError;

use super::envelope::Outbound;
use super::hub::Hub;
use super::liveness::LivenessConfig;
use super::session::{CloseReason, Identity, Session};

/// Register a freshly authenticated connection and start its pumps.
pub async fn accept_connection<S, K, E>(
    hub: &Hub,
    identity: Identity,
    stream: S,
    sink: K,
) -> Result<Arc<Session>, HubError>
where
    S: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
    K: Sink<Message> + Send + Unpin + 'static,
    K::Error: Display + Send,
{
    let (session, queue) = hub.new_session(identity);
    session.attach_pumps();
    hub.register(session.clone()).await?;
    tokio::spawn(run_session(hub.clone(), session.clone(), stream, sink, queue));
    Ok(session)
}

/// Drive a registered session until both pumps stop, then unregister it.
pub async fn run_session<S, K, E>(
    hub: Hub,
    session: Arc<Session>,
    stream: S,
    sink: K,
    queue: mpsc::Receiver<Outbound>,
) where
    S: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
    K: Sink<Message> + Send + Unpin + 'static,
    K::Error: Display + Send,
{
    let liveness = *hub.config().liveness();
    session.attach_pumps();
    session.mark_active();

    let reader = tokio::spawn(read_pump(session.clone(), stream, liveness));
    let writer = tokio::spawn(write_pump(session.clone(), sink, queue, liveness));
    let (read_result, write_result) = tokio::join!(reader, writer);
    for result in [read_result, write_result] {
        if let Err(e) = result {
            tracing::error!(?e, session_id = %session.id(), "pump task failed");
        }
    }

    // A panicked pump never got to close the session.
    session.close(CloseReason::Unregistered);
    if let Err(e) = hub.unregister(session.id()).await {
        tracing::debug!(%e, session_id = %session.id(), "hub gone before unregister");
    }
    session.mark_closed();

    tracing::info!(
        session_id = %session.id(),
        subject = %session.identity().subject,
        reason = ?session.close_reason(),
        delivered = session.delivered(),
        dropped = session.dropped(),
        "session ended"
    );
}

/// Read control frames until the peer goes away, goes quiet, or the session closes.
pub async fn read_pump<S, E>(session: Arc<Session>, mut stream: S, liveness: LivenessConfig)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut deadline = liveness.read_deadline();
    let closed = session.closed();
    tokio::pin!(closed);

    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = &mut closed => return,
            next = time::timeout_at(deadline.instant(), stream.next()) => next,
        };

        let message = match next {
            Err(_) => break CloseReason::LivenessTimeout,
            Ok(None) => break CloseReason::PeerClosed,
            Ok(Some(Err(e))) => {
                tracing::debug!(error = %e, session_id = %session.id(), "ws read error");
                break CloseReason::ReadFailed;
            }
            Ok(Some(Ok(message))) => message,
        };

        // Any traffic at all counts as proof of life.
        deadline.touch();

        match message {
            Message::Text(text) => {
                if text.as_str().len() > liveness.max_message_bytes() {
                    break CloseReason::MessageTooLarge;
                }
                handle_control(&session, text.as_str());
            }
            Message::Binary(bytes) => {
                if bytes.len() > liveness.max_message_bytes() {
                    break CloseReason::MessageTooLarge;
                }
                tracing::debug!(session_id = %session.id(), "ignoring binary frame");
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break CloseReason::PeerClosed,
        }
    };

    if session.close(reason) {
        tracing::info!(session_id = %session.id(), ?reason, "reader closing session");
    }
}

fn handle_control(session: &Session, text: &str) {
    match ControlFrame::parse(text) {
        Ok(ControlFrame::Subscribe(topics)) => {
            tracing::debug!(session_id = %session.id(), ?topics, "subscribe");
            session.subscribe(topics);
        }
        Ok(ControlFrame::Unsubscribe(topics)) => {
            tracing::debug!(session_id = %session.id(), ?topics, "unsubscribe");
            session.unsubscribe(&topics);
        }
        Ok(ControlFrame::Ping) => {
            session.enqueue(Outbound::Pong);
        }
        Ok(ControlFrame::Unknown(kind)) => {
            tracing::debug!(session_id = %session.id(), %kind, "ignoring unknown control frame");
        }
        Err(e) => {
            tracing::warn!(session_id = %session.id(), error = %e, "invalid control frame");
        }
    }
}

/// Drain the outbound queue and send keepalive pings until the session closes.
pub async fn write_pump<K>(
    session: Arc<Session>,
    mut sink: K,
    mut queue: mpsc::Receiver<Outbound>,
    liveness: LivenessConfig,
) where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let mut keepalive = liveness.keepalive_ticker();
    let closed = session.closed();
    tokio::pin!(closed);

    loop {
        let message = tokio::select! {
            biased;
            _ = &mut closed => break,
            item = queue.recv() => match item {
                Some(Outbound::Event(envelope)) => Message::Text(envelope.frame()),
                Some(Outbound::Pong) => match pong_frame() {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!(?e, "failed to encode pong frame");
                        continue;
                    }
                },
                None => break,
            },
            _ = keepalive.tick() => Message::Ping(Bytes::new()),
        };

        if !deliver(&session, &mut sink, message, liveness.write_wait()).await {
            if session.close(CloseReason::WriteFailed) {
                tracing::info!(session_id = %session.id(), "writer closing session");
            }
            break;
        }
    }

    // Whatever is still queued is discarded.
    queue.close();
    drop(queue);

    match session.close_reason() {
        Some(CloseReason::WriteFailed) | Some(CloseReason::PeerClosed) | None => {}
        Some(reason) => {
            let (code, text) = reason.close_frame();
            let frame = Message::Close(Some(CloseFrame {
                code,
                reason: Utf8Bytes::from_static(text),
            }));
            deliver(&session, &mut sink, frame, liveness.write_wait()).await;
        }
    }
    let _ = time::timeout(liveness.write_wait(), sink.close()).await;
}

/// Send one frame within the write deadline.
async fn deliver<K>(session: &Session, sink: &mut K, message: Message, wait: Duration) -> bool
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    match time::timeout(wait, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, session_id = %session.id(), "ws write error");
            false
        }
        Err(_) => {
            tracing::debug!(session_id = %session.id(), "write deadline exceeded");
            false
        }
    }
}

fn pong_frame() -> serde_json::Result<Message> {
    let text = ServerFrame::encode(EventKind::PONG, &Value::Null, Utc::now())?;
    Ok(Message::Text(text.into()))
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;

    use futures_util::{sink, stream};

    use super::*;
    use crate::auth::tokens::Role;
    use crate::gateway::hub::HubConfig;
    use crate::gateway::session::SessionState;

    type Inbound = Result<Message, io::Error>;
    type TestStream = Pin<Box<dyn Stream<Item = Inbound> + Send>>;
    type TestSink = Pin<Box<dyn Sink<Message, Error = io::Error> + Send>>;

    /// In-memory connection: the test plays the client on the other side.
    struct Client {
        inbound: mpsc::UnboundedSender<Inbound>,
        outbound: mpsc::UnboundedReceiver<Message>,
    }

    impl Client {
        fn send_text(&self, text: &str) {
            self.inbound
                .send(Ok(Message::Text(text.to_string().into())))
                .unwrap();
        }

        /// Next text frame, skipping keepalive pings.
        async fn next_frame(&mut self) -> ServerFrame {
            loop {
                let message = time::timeout(Duration::from_secs(2), self.outbound.recv())
                    .await
                    .expect("timed out waiting for a frame")
                    .expect("connection closed");
                if let Message::Text(text) = message {
                    return ServerFrame::decode(text.as_str()).unwrap();
                }
            }
        }

        /// Code of the close frame, skipping everything before it.
        async fn close_code(&mut self) -> u16 {
            loop {
                let message = time::timeout(Duration::from_secs(2), self.outbound.recv())
                    .await
                    .expect("timed out waiting for close")
                    .expect("connection closed without a close frame");
                if let Message::Close(Some(frame)) = message {
                    return frame.code;
                }
            }
        }
    }

    fn transport() -> (Client, TestStream, TestSink) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();

        let stream = stream::unfold(inbound_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let sink = sink::unfold(outbound_tx, |tx, message: Message| async move {
            tx.send(message)
                .map_err(|_| io::Error::other("client went away"))?;
            Ok::<_, io::Error>(tx)
        });

        let client = Client {
            inbound: inbound_tx,
            outbound: outbound_rx,
        };
        (client, Box::pin(stream), Box::pin(sink))
    }

    fn hub_with(liveness: LivenessConfig) -> Hub {
        Hub::spawn(HubConfig::new(8, 64, liveness).unwrap())
    }

    fn identity() -> Identity {
        Identity {
            subject: "ops@example.com".to_string(),
            role: Role::Operator,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let hub = hub_with(LivenessConfig::default());
        let (mut client, stream, sink) = transport();
        let session = accept_connection(&hub, identity(), stream, sink).await.unwrap();

        client.send_text(r#"{"type":"ping"}"#);
        let frame = client.next_frame().await;
        assert_eq!(frame.kind, "pong");
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn subscribe_frame_narrows_delivery() {
        let hub = hub_with(LivenessConfig::default());
        let (mut client, stream, sink) = transport();
        let session = accept_connection(&hub, identity(), stream, sink).await.unwrap();

        client.send_text(r#"{"type":"subscribe","data":["dex"]}"#);
        let dex_only = session.clone();
        wait_until(move || !dex_only.subscriptions().contains("all")).await;

        hub.publish("oracle_price", "oracle", serde_json::json!({"px": 1}));
        hub.publish("dex_swap", "dex", serde_json::json!({"px": 2}));

        let frame = client.next_frame().await;
        assert_eq!(frame.kind, "dex_swap");
        assert_eq!(frame.data["px"], 2);
    }

    #[tokio::test]
    async fn malformed_frames_keep_the_connection_open() {
        let hub = hub_with(LivenessConfig::default());
        let (mut client, stream, sink) = transport();
        let session = accept_connection(&hub, identity(), stream, sink).await.unwrap();

        client.send_text("not json");
        client.send_text(r#"{"type":"subscribe","data":[]}"#);
        client.send_text(r#"{"type":"resync"}"#);
        client.send_text(r#"{"type":"ping"}"#);

        assert_eq!(client.next_frame().await.kind, "pong");
        assert!(!session.is_closed());
        assert!(session.subscriptions().contains("all"));
        assert_eq!(hub.stats().connected_clients, 1);
    }

    #[tokio::test]
    async fn silent_client_is_reaped() {
        let liveness =
            LivenessConfig::new(Duration::from_millis(150), Duration::from_secs(1), 512).unwrap();
        let hub = hub_with(liveness);
        let (mut client, stream, sink) = transport();
        let session = accept_connection(&hub, identity(), stream, sink).await.unwrap();
        assert_eq!(hub.stats().connected_clients, 1);

        // Pings go out and are written fine, but nothing ever comes back.
        assert_eq!(client.close_code().await, 4009);
        let reaped = session.clone();
        wait_until(move || reaped.state() == SessionState::Closed).await;

        assert_eq!(session.close_reason(), Some(CloseReason::LivenessTimeout));
        assert_eq!(hub.stats().connected_clients, 0);
    }

    #[tokio::test]
    async fn inbound_traffic_extends_the_deadline() {
        let liveness =
            LivenessConfig::new(Duration::from_millis(150), Duration::from_secs(1), 512).unwrap();
        let hub = hub_with(liveness);
        let (client, stream, sink) = transport();
        let session = accept_connection(&hub, identity(), stream, sink).await.unwrap();

        for _ in 0..8 {
            time::sleep(Duration::from_millis(50)).await;
            client.inbound.send(Ok(Message::Pong(Bytes::new()))).unwrap();
        }

        assert!(!session.is_closed());
        assert_eq!(hub.stats().connected_clients, 1);
    }

    #[tokio::test]
    async fn oversized_frame_closes_the_session() {
        let liveness =
            LivenessConfig::new(Duration::from_secs(60), Duration::from_secs(1), 32).unwrap();
        let hub = hub_with(liveness);
        let (mut client, stream, sink) = transport();
        let session = accept_connection(&hub, identity(), stream, sink).await.unwrap();

        client.send_text(&format!(r#"{{"type":"subscribe","data":["{}"]}}"#, "x".repeat(64)));

        assert_eq!(client.close_code().await, 1009);
        assert_eq!(session.close_reason(), Some(CloseReason::MessageTooLarge));
    }

    #[tokio::test]
    async fn peer_disconnect_unregisters() {
        let hub = hub_with(LivenessConfig::default());
        let (client, stream, sink) = transport();
        let session = accept_connection(&hub, identity(), stream, sink).await.unwrap();

        drop(client);

        let ended = session.clone();
        wait_until(move || ended.state() == SessionState::Closed).await;
        assert_eq!(session.close_reason(), Some(CloseReason::PeerClosed));
        assert_eq!(hub.stats().connected_clients, 0);
    }

    #[tokio::test]
    async fn write_failure_unregisters() {
        let hub = hub_with(LivenessConfig::default());
        let (client, stream, sink) = transport();
        let session = accept_connection(&hub, identity(), stream, sink).await.unwrap();

        // Keep the inbound side open but stop reading outbound frames.
        let Client { inbound, outbound } = client;
        drop(outbound);
        hub.publish("block", "blocks", serde_json::json!({"height": 1}));

        let ended = session.clone();
        wait_until(move || ended.state() == SessionState::Closed).await;
        assert_eq!(session.close_reason(), Some(CloseReason::WriteFailed));
        assert_eq!(hub.stats().connected_clients, 0);
        drop(inbound);
    }

    #[tokio::test]
    async fn admin_disconnect_sends_close_frame() {
        let hub = hub_with(LivenessConfig::default());
        let (mut client, stream, sink) = transport();
        let session = accept_connection(&hub, identity(), stream, sink).await.unwrap();

        assert!(hub.disconnect(session.id()).await.unwrap());
        assert_eq!(client.close_code().await, 4010);

        let ended = session.clone();
        wait_until(move || ended.state() == SessionState::Closed).await;
        assert_eq!(session.close_reason(), Some(CloseReason::AdminDisconnect));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_returns_after_every_session_is_closed() {
        let hub = hub_with(LivenessConfig::default());
        let mut connections = Vec::new();
        for _ in 0..200 {
            let (client, stream, sink) = transport();
            let session = accept_connection(&hub, identity(), stream, sink).await.unwrap();
            connections.push((client, session));
        }
        assert_eq!(hub.stats().connected_clients, 200);

        hub.shutdown().await.unwrap();

        for (client, session) in &mut connections {
            assert_eq!(session.state(), SessionState::Closed);
            assert_eq!(session.close_reason(), Some(CloseReason::HubShutdown));

            // The going-away frame was already written when shutdown returned.
            let mut code = None;
            while let Ok(message) = client.outbound.try_recv() {
                if let Message::Close(Some(frame)) = message {
                    code = Some(frame.code);
                }
            }
            assert_eq!(code, Some(1001));
        }
        assert_eq!(hub.stats().connected_clients, 0);
    }
}
