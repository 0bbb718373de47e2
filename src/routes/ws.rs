//! WebSocket handler — the persistent channel behind every room feature.
//!
//! DESIGN
//! ======
//! On upgrade, credentials resolve to an identity and the connection enters
//! a `select!` loop:
//! - Inbound client events → parse + dispatch by event kind
//! - Fanout events from room peers → forward to the client
//!
//! Dispatch hands room-scoped events to the relay, negotiation messages to
//! the signaling relay, and join/leave to the lifecycle manager. Handlers
//! return events for the sender; fanout to peers happens inside the
//! services, never here.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → `session-connected` with the resolved identity
//! 2. `join-room` → registration + `room-snapshot`
//! 3. Events relay until the socket closes
//! 4. Close without `leave-room` → transport loss (reconnect window stays
//!    open); explicit `leave-room` departs immediately

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{ClientEvent, ErrorCode, ServerEvent};
use crate::services::identity::{self, Identity, IdentityError};
use crate::services::lifecycle;
use crate::services::relay::{self, RoomEvent};
use crate::services::signaling::{self, SignalMessage};
use crate::state::AppState;

/// Outbound queue depth per connection. A client that cannot drain this
/// many events is treated as a failed delivery target.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// GATEWAY ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
enum GatewayError {
    #[error("invalid event: {0}")]
    BadEvent(String),
    #[error("must join a room first")]
    NotInRoom,
}

impl ErrorCode for GatewayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::BadEvent(_) => "E_BAD_EVENT",
            Self::NotInRoom => "E_NOT_IN_ROOM",
        }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.get("token").map(String::as_str);
    let guest_id = params.get("guest").and_then(|s| s.parse().ok());

    match identity::resolve_identity(&state.pool, token, guest_id).await {
        Ok(identity) => ws.on_upgrade(move |socket| run_ws(socket, state, identity)),
        Err(IdentityError::InvalidToken) => {
            (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response()
        }
        Err(IdentityError::Upstream(e)) => {
            tracing::error!(error = %e, "ws identity validation failed");
            (StatusCode::SERVICE_UNAVAILABLE, "identity validation unavailable").into_response()
        }
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, mut identity: Identity) {
    // Per-connection channel for fanout events from room peers.
    let (client_tx, mut client_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE_CAPACITY);

    let welcome = ServerEvent::SessionConnected {
        user_id: identity.user_id,
        display_name: identity.display_name.clone(),
        is_guest: identity.is_guest,
    };
    if send_event(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(user_id = %identity.user_id, is_guest = identity.is_guest, "ws: client connected");

    // The registry connection this transport is attached to, if joined.
    // The transport id proves ownership: a socket superseded by a reconnect
    // must not disturb the record on its way out.
    let mut current_conn: Option<(Uuid, Uuid)> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies =
                            process_text(&state, &mut current_conn, &mut identity, &client_tx, &text).await;
                        for event in replies {
                            // A failed send surfaces on the next recv.
                            let _ = send_event(&mut socket, &event).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(event) = client_rx.recv() => {
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    // Abrupt close: keep the record active pending reconnect; the stale
    // sweep finishes the departure if the client never returns.
    if let Some((conn_id, transport_id)) = current_conn {
        lifecycle::transport_lost(&state, conn_id, transport_id).await;
    }
    info!(user_id = %identity.user_id, "ws: client disconnected");
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Parse one inbound text message and process it, returning events for the
/// sender. Split from the socket loop so tests drive dispatch without a
/// transport.
async fn process_text(
    state: &AppState,
    current_conn: &mut Option<(Uuid, Uuid)>,
    identity: &mut Identity,
    client_tx: &mpsc::Sender<ServerEvent>,
    text: &str,
) -> Vec<ServerEvent> {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(user_id = %identity.user_id, error = %e, "ws: invalid inbound event");
            return vec![ServerEvent::error_from(&GatewayError::BadEvent(e.to_string()))];
        }
    };

    process_client_event(state, current_conn, identity, client_tx, event).await
}

async fn process_client_event(
    state: &AppState,
    current_conn: &mut Option<(Uuid, Uuid)>,
    identity: &mut Identity,
    client_tx: &mpsc::Sender<ServerEvent>,
    event: ClientEvent,
) -> Vec<ServerEvent> {
    match event {
        ClientEvent::JoinRoom { room, display_name, user_agent } => {
            // Guests may pick a display name at join; authenticated users
            // keep their stored one.
            if identity.is_guest {
                if let Some(name) = display_name.filter(|n| !n.trim().is_empty()) {
                    identity.display_name = name;
                }
            }

            // Depart the current room before attaching to another.
            if let Some((conn_id, transport_id)) = current_conn.take() {
                lifecycle::leave(state, conn_id, transport_id).await;
            }

            match lifecycle::join(state, &room, identity, client_tx.clone()).await {
                Ok(joined) => {
                    debug!(
                        conn_id = %joined.connection.id,
                        user_agent = user_agent.as_deref().unwrap_or("-"),
                        "ws: joined"
                    );
                    *current_conn = Some((joined.connection.id, joined.connection.transport_id));
                    vec![ServerEvent::RoomSnapshot(joined.snapshot)]
                }
                Err(e) => vec![ServerEvent::error_from(&e)],
            }
        }
        ClientEvent::LeaveRoom => {
            if let Some((conn_id, transport_id)) = current_conn.take() {
                lifecycle::leave(state, conn_id, transport_id).await;
            }
            Vec::new()
        }
        ClientEvent::HeartbeatPing => {
            if let Some((conn_id, _)) = *current_conn {
                state.registry.write().await.touch(conn_id);
            }
            vec![ServerEvent::HeartbeatPong]
        }
        ClientEvent::WebrtcOffer { target, sdp } => {
            relay_signal(state, *current_conn, target, SignalMessage::Offer { sdp }).await
        }
        ClientEvent::WebrtcAnswer { target, sdp } => {
            relay_signal(state, *current_conn, target, SignalMessage::Answer { sdp }).await
        }
        ClientEvent::WebrtcIceCandidate { target, candidate } => {
            relay_signal(state, *current_conn, target, SignalMessage::IceCandidate { candidate }).await
        }
        ClientEvent::ChatMessage { content } => {
            relay_room_event(state, *current_conn, RoomEvent::Chat { content }).await
        }
        ClientEvent::TypingStart => relay_room_event(state, *current_conn, RoomEvent::TypingStart).await,
        ClientEvent::TypingStop => relay_room_event(state, *current_conn, RoomEvent::TypingStop).await,
        ClientEvent::DrawOp { op } => {
            relay_room_event(state, *current_conn, RoomEvent::Draw { op }).await
        }
        ClientEvent::DrawClear => relay_room_event(state, *current_conn, RoomEvent::DrawClear).await,
        ClientEvent::NoteMutate { note_id, content } => {
            relay_room_event(state, *current_conn, RoomEvent::Note { note_id, content }).await
        }
        ClientEvent::TimerControl { timer } => {
            relay_room_event(state, *current_conn, RoomEvent::Timer { timer }).await
        }
        ClientEvent::MediaToggle { video, audio } => {
            relay_room_event(state, *current_conn, RoomEvent::MediaToggle { video, audio }).await
        }
        ClientEvent::ScreenShareToggle { active } => {
            relay_room_event(state, *current_conn, RoomEvent::ScreenShare { active }).await
        }
        ClientEvent::HandRaise { raised } => {
            relay_room_event(state, *current_conn, RoomEvent::HandRaise { raised }).await
        }
    }
}

/// Route a room-scoped event through the relay; errors come back to the
/// sender only.
async fn relay_room_event(
    state: &AppState,
    current_conn: Option<(Uuid, Uuid)>,
    event: RoomEvent,
) -> Vec<ServerEvent> {
    let Some((conn_id, _)) = current_conn else {
        return vec![ServerEvent::error_from(&GatewayError::NotInRoom)];
    };
    match relay::relay(state, conn_id, event).await {
        Ok(()) => Vec::new(),
        Err(e) => vec![ServerEvent::error_from(&e)],
    }
}

/// Route a negotiation message through the signaling relay.
async fn relay_signal(
    state: &AppState,
    current_conn: Option<(Uuid, Uuid)>,
    target: Uuid,
    signal: SignalMessage,
) -> Vec<ServerEvent> {
    let Some((conn_id, _)) = current_conn else {
        return vec![ServerEvent::error_from(&GatewayError::NotInRoom)];
    };
    match signaling::relay_signal(state, conn_id, target, signal).await {
        Ok(()) => Vec::new(),
        Err(e) => vec![ServerEvent::error_from(&e)],
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize event");
            return Err(());
        }
    };
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
