//! Event relay / fanout engine.
//!
//! DESIGN
//! ======
//! One entry point: resolve the origin connection, authorize the event kind
//! against the origin's permission snapshot, apply any durable room-session
//! effect, then deliver to every other active connection in the room. The
//! registry and session table are consulted, never bypassed.
//!
//! Ordering: events from one origin are relayed one at a time by that
//! origin's connection task, and each apply+fanout is a single atomic
//! mutation under the session-table lock, so delivery is FIFO per
//! origin→target edge. No cross-origin order is promised.
//!
//! ERROR HANDLING
//! ==============
//! `UnknownConnection` and `Forbidden` are terminal for the single event:
//! dropped, no fanout, no mutation, error acknowledged to the origin only.
//! Per-target delivery failures are isolated inside the session broadcast.

use tracing::debug;
use uuid::Uuid;

use crate::event::{ChatMessage, ErrorCode, MediaState, ServerEvent, Stroke, TimerState, now_ms};
use crate::services::presence::{Connection, PermissionSet};
use crate::state::AppState;

// =============================================================================
// TYPES
// =============================================================================

/// A room-scoped event as accepted by the relay. One variant per kind;
/// signaling and lifecycle traffic never pass through here.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Chat { content: String },
    TypingStart,
    TypingStop,
    Draw { op: Stroke },
    DrawClear,
    Note { note_id: Uuid, content: String },
    Timer { timer: TimerState },
    MediaToggle { video: bool, audio: bool },
    ScreenShare { active: bool },
    HandRaise { raised: bool },
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The origin connection id is not an active registry record (e.g. the
    /// event raced against a sweep).
    #[error("unknown connection: {0}")]
    UnknownConnection(Uuid),
    /// The origin's permission snapshot does not allow this event kind.
    #[error("not permitted: {0}")]
    Forbidden(&'static str),
}

impl ErrorCode for RelayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownConnection(_) => "E_UNKNOWN_CONNECTION",
            Self::Forbidden(_) => "E_FORBIDDEN",
        }
    }
}

// =============================================================================
// AUTHORIZATION
// =============================================================================

/// Check the event kind against the origin's permission snapshot.
fn authorize(permissions: &PermissionSet, event: &RoomEvent) -> Result<(), RelayError> {
    let allowed = match event {
        RoomEvent::Chat { .. } | RoomEvent::TypingStart | RoomEvent::TypingStop => {
            (permissions.can_chat, "chat")
        }
        RoomEvent::Draw { .. } | RoomEvent::DrawClear | RoomEvent::Note { .. } => {
            (permissions.can_use_whiteboard, "whiteboard")
        }
        RoomEvent::Timer { .. } => (permissions.can_manage_room, "timer control"),
        RoomEvent::ScreenShare { .. } => (permissions.can_share, "screen share"),
        RoomEvent::MediaToggle { .. } | RoomEvent::HandRaise { .. } => (true, ""),
    };

    match allowed {
        (true, _) => Ok(()),
        (false, what) => Err(RelayError::Forbidden(what)),
    }
}

/// Media flags after applying a toggle, if the event carries one.
fn updated_media(current: MediaState, event: &RoomEvent) -> Option<MediaState> {
    match event {
        RoomEvent::MediaToggle { video, audio } => {
            Some(MediaState { video: *video, audio: *audio, ..current })
        }
        RoomEvent::ScreenShare { active } => Some(MediaState { screen_share: *active, ..current }),
        _ => None,
    }
}

// =============================================================================
// RELAY
// =============================================================================

/// Relay one room-scoped event from an origin connection.
///
/// # Errors
///
/// `UnknownConnection` when the origin is not active; `Forbidden` when the
/// origin lacks the event kind's required permission. Either way the event
/// is dropped without fanout or mutation.
pub async fn relay(state: &AppState, origin_conn_id: Uuid, event: RoomEvent) -> Result<(), RelayError> {
    // Resolve + authorize + touch under a single registry lock scope.
    let origin: Connection = {
        let mut registry = state.registry.write().await;
        let Some(conn) = registry.get(origin_conn_id).filter(|c| c.is_active()).cloned() else {
            return Err(RelayError::UnknownConnection(origin_conn_id));
        };
        authorize(&conn.permissions, &event)?;
        registry.touch(origin_conn_id);

        match updated_media(conn.media, &event) {
            Some(media) => {
                registry.set_media(origin_conn_id, media);
                Connection { media, ..conn }
            }
            None => conn,
        }
    };

    // Apply + fan out atomically under the session-table lock.
    let mut rooms = state.rooms.write().await;
    let Some(session) = rooms.get_mut(origin.room_id) else {
        debug!(conn_id = %origin_conn_id, room_id = %origin.room_id, "relay into missing session; dropped");
        return Err(RelayError::UnknownConnection(origin_conn_id));
    };

    let outbound = match event {
        RoomEvent::Chat { content } => {
            let message = ChatMessage {
                id: Uuid::new_v4(),
                user_id: origin.user_id,
                display_name: origin.display_name.clone(),
                content,
                sent_at: now_ms(),
            };
            session.append_message(message.clone());
            ServerEvent::ChatMessage(message)
        }
        RoomEvent::TypingStart => ServerEvent::TypingStart { user_id: origin.user_id },
        RoomEvent::TypingStop => ServerEvent::TypingStop { user_id: origin.user_id },
        RoomEvent::Draw { op } => {
            session.apply_draw(op.clone());
            ServerEvent::DrawOp { user_id: origin.user_id, op }
        }
        RoomEvent::DrawClear => {
            session.clear_board();
            ServerEvent::DrawClear { user_id: origin.user_id }
        }
        RoomEvent::Note { note_id, content } => {
            session.upsert_note(note_id, content.clone());
            ServerEvent::NoteMutated { user_id: origin.user_id, note_id, content }
        }
        RoomEvent::Timer { timer } => {
            session.set_timer(timer);
            ServerEvent::TimerState { timer }
        }
        RoomEvent::MediaToggle { .. } => {
            session.set_participant_media(origin.user_id, origin.media);
            ServerEvent::MediaToggled { user_id: origin.user_id, media: origin.media }
        }
        RoomEvent::ScreenShare { active } => {
            session.set_participant_media(origin.user_id, origin.media);
            ServerEvent::ScreenShareToggled { user_id: origin.user_id, active }
        }
        RoomEvent::HandRaise { raised } => {
            ServerEvent::HandRaised { user_id: origin.user_id, raised }
        }
    };

    session.broadcast(&outbound, Some(origin_conn_id));
    Ok(())
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;
