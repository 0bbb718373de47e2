//! Signaling relay — WebRTC negotiation, unicast peer to peer.
//!
//! DESIGN
//! ======
//! A thin specialization of the fanout engine for offer / answer /
//! ice-candidate messages. Routed by target user id within the origin's
//! room, never broadcast. Signaling is symmetric, so the only check is
//! that the sender is an active connection in the room; nothing is
//! written to the room session.
//!
//! A target that disconnected between send and delivery is a silent drop:
//! the caller's peer-connection attempt simply times out on its side.

use tracing::debug;
use uuid::Uuid;

use crate::event::{ErrorCode, ServerEvent};
use crate::state::AppState;

/// One WebRTC negotiation message, as relayed.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: serde_json::Value },
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("unknown connection: {0}")]
    UnknownConnection(Uuid),
}

impl ErrorCode for SignalError {
    fn error_code(&self) -> &'static str {
        "E_UNKNOWN_CONNECTION"
    }
}

/// Relay one negotiation message to a peer in the origin's room.
///
/// # Errors
///
/// `UnknownConnection` when the origin is not an active registry record.
/// An absent or unreachable target is not an error.
pub async fn relay_signal(
    state: &AppState,
    origin_conn_id: Uuid,
    target_user: Uuid,
    signal: SignalMessage,
) -> Result<(), SignalError> {
    let origin = {
        let mut registry = state.registry.write().await;
        let Some(conn) = registry.get(origin_conn_id).filter(|c| c.is_active()).cloned() else {
            return Err(SignalError::UnknownConnection(origin_conn_id));
        };
        registry.touch(origin_conn_id);
        conn
    };

    let outbound = match signal {
        SignalMessage::Offer { sdp } => ServerEvent::WebrtcOffer { from: origin.user_id, sdp },
        SignalMessage::Answer { sdp } => ServerEvent::WebrtcAnswer { from: origin.user_id, sdp },
        SignalMessage::IceCandidate { candidate } => {
            ServerEvent::WebrtcIceCandidate { from: origin.user_id, candidate }
        }
    };

    let rooms = state.rooms.read().await;
    let delivered = rooms
        .get(origin.room_id)
        .is_some_and(|session| session.unicast(target_user, &outbound));

    if !delivered {
        debug!(
            from = %origin.user_id,
            to = %target_user,
            room_id = %origin.room_id,
            "signaling target unreachable; dropped"
        );
    }
    Ok(())
}

#[cfg(test)]
#[path = "signaling_test.rs"]
mod tests;
