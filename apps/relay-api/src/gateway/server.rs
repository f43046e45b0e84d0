//! WebSocket upgrade handler.

use axum::extract::ws::WebSocket;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;

use crate::auth::middleware::SocketIdentity;
use crate::AppState;

use super::pumps::accept_connection;
use super::session::Identity;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

/// The token is checked before the upgrade, so unauthenticated clients get
/// a plain 401 instead of a socket.
///
/// Inbound frames are capped at the transport, so an oversized frame fails
/// the read before it is buffered.
async fn ws_upgrade(
    SocketIdentity(identity): SocketIdentity,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let limit = state.hub.config().liveness().max_message_bytes();
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_connection(socket, state, identity))
}

async fn handle_connection(socket: WebSocket, state: AppState, identity: Identity) {
    let subject = identity.subject.clone();
    let (ws_tx, ws_rx) = socket.split();

    match accept_connection(&state.hub, identity, ws_rx, ws_tx).await {
        Ok(session) => {
            tracing::info!(
                session_id = %session.id(),
                subject = %subject,
                "gateway session established"
            );
        }
        Err(e) => {
            // Dropping both halves closes the socket.
            tracing::warn!(%e, subject = %subject, "rejected connection");
        }
    }
}
