//! WebSocket control surface: upgrades viewer connections and bridges them
//! onto the per-session mailbox.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::ClientMessage;
use crate::session::{SessionEvent, SessionManager};

/// Shared router state.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Client-supplied session identity token; reconnects with the same
    /// token resume the same run within the TTL window.
    client: Option<String>,
}

/// Axum handler for the `/ws` endpoint.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity = params
        .client
        .filter(|token| !token.is_empty())
        .unwrap_or_else(|| format!("anon-{:016x}", rand::random::<u64>()));
    ws.on_upgrade(move |socket| serve_socket(socket, state.sessions, identity))
}

/// Runs one viewer connection: a writer task drains the session's outbound
/// channel onto the socket while the read loop feeds parsed control messages
/// into the session mailbox. Either side ending detaches the transport.
async fn serve_socket(socket: WebSocket, sessions: SessionManager, identity: String) {
    info!(identity, "viewer connected");
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let connection = sessions.attach(&identity, out_tx);

    let writer = async {
        while let Some(message) = out_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%err, "failed to serialize outbound message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                debug!("socket closed while writing");
                break;
            }
        }
    };

    let reader = async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let event = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(parsed) => SessionEvent::Control(parsed),
                        Err(err) => SessionEvent::Malformed(err.to_string()),
                    };
                    if connection.events.send(event).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("socket closed by viewer");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(%err, "socket error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        () = writer => {}
        () = reader => {}
    }

    let _ = connection.events.send(SessionEvent::Disconnect { conn: connection.conn });
    info!(identity, "viewer disconnected");
}
