//! Wire protocol — tagged event types for the room channel.
//!
//! ARCHITECTURE
//! ============
//! Every message on the websocket is one JSON object:
//! `{"event": "<name>", "data": {...}}`. Inbound messages deserialize into
//! `ClientEvent`, outbound into `ServerEvent`, one variant per event kind.
//! The relay dispatches on the variant and never inspects loose fields.
//!
//! DESIGN
//! ======
//! - Event names are kebab-case on the wire (`join-room`, `webrtc-offer`).
//! - Unit variants (`typing-start`, `heartbeat-ping`) carry no `data` key.
//! - Errors are structured: grepable code + human message + retryable flag,
//!   built from any service error through the `ErrorCode` trait.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for outbound `error` events.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// SHARED PAYLOAD TYPES
// =============================================================================

/// Client-reported media flags. Last-known-good, never verified server-side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaState {
    pub video: bool,
    pub audio: bool,
    pub screen_share: bool,
}

/// One point of a whiteboard stroke, in board coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// One whiteboard draw operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub id: Uuid,
    pub color: String,
    pub width: f64,
    pub points: Vec<Point>,
}

/// Shared timer modes (pomodoro-style focus/break cycle).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimerMode {
    #[default]
    Focus,
    ShortBreak,
    LongBreak,
}

/// Default focus session length in seconds.
pub const DEFAULT_FOCUS_SECS: u64 = 25 * 60;

/// The single authoritative timer state of a room. Whole-state replaced on
/// every timer control, never patched field-by-field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    pub running: bool,
    pub remaining_secs: u64,
    pub mode: TimerMode,
    pub completed_sessions: u32,
}

impl Default for TimerState {
    fn default() -> Self {
        Self {
            running: false,
            remaining_secs: DEFAULT_FOCUS_SECS,
            mode: TimerMode::Focus,
            completed_sessions: 0,
        }
    }
}

/// One chat message as fanned out and kept in the room backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub content: String,
    /// Milliseconds since Unix epoch.
    pub sent_at: i64,
}

/// One collaborative note's latest content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub note_id: Uuid,
    pub content: String,
}

/// Summary of one participant as seen by the rest of the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: Uuid,
    pub display_name: String,
    pub is_guest: bool,
    pub is_host: bool,
    pub media: MediaState,
}

/// Everything a newly joined connection needs to catch up. Sent once on
/// join, never polled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: Uuid,
    pub room_code: String,
    pub participants: Vec<ParticipantInfo>,
    pub messages: Vec<ChatMessage>,
    pub strokes: Vec<Stroke>,
    pub notes: Vec<Note>,
    pub timer: TimerState,
}

// =============================================================================
// INBOUND EVENTS
// =============================================================================

/// Events a client may send. One variant per inbound event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Attach this connection to a room, by id or human room code.
    JoinRoom {
        room: String,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        user_agent: Option<String>,
    },
    LeaveRoom,
    ChatMessage {
        content: String,
    },
    TypingStart,
    TypingStop,
    DrawOp {
        op: Stroke,
    },
    DrawClear,
    NoteMutate {
        note_id: Uuid,
        content: String,
    },
    TimerControl {
        timer: TimerState,
    },
    MediaToggle {
        video: bool,
        audio: bool,
    },
    ScreenShareToggle {
        active: bool,
    },
    HandRaise {
        raised: bool,
    },
    WebrtcOffer {
        target: Uuid,
        sdp: String,
    },
    WebrtcAnswer {
        target: Uuid,
        sdp: String,
    },
    WebrtcIceCandidate {
        target: Uuid,
        candidate: serde_json::Value,
    },
    HeartbeatPing,
}

// =============================================================================
// OUTBOUND EVENTS
// =============================================================================

/// Events the server delivers. One variant per outbound event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// First event on every connection: tells the client its resolved
    /// identity (guests need the synthesized id for reconnects).
    SessionConnected {
        user_id: Uuid,
        display_name: String,
        is_guest: bool,
    },
    RoomSnapshot(RoomSnapshot),
    ParticipantJoined {
        participant: ParticipantInfo,
    },
    ParticipantLeft {
        user_id: Uuid,
        display_name: String,
    },
    HostChanged {
        user_id: Uuid,
        display_name: String,
    },
    ChatMessage(ChatMessage),
    TypingStart {
        user_id: Uuid,
    },
    TypingStop {
        user_id: Uuid,
    },
    DrawOp {
        user_id: Uuid,
        op: Stroke,
    },
    DrawClear {
        user_id: Uuid,
    },
    NoteMutated {
        user_id: Uuid,
        note_id: Uuid,
        content: String,
    },
    TimerState {
        timer: TimerState,
    },
    MediaToggled {
        user_id: Uuid,
        media: MediaState,
    },
    ScreenShareToggled {
        user_id: Uuid,
        active: bool,
    },
    HandRaised {
        user_id: Uuid,
        raised: bool,
    },
    WebrtcOffer {
        from: Uuid,
        sdp: String,
    },
    WebrtcAnswer {
        from: Uuid,
        sdp: String,
    },
    WebrtcIceCandidate {
        from: Uuid,
        candidate: serde_json::Value,
    },
    HeartbeatPong,
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl ServerEvent {
    /// Build a structured `error` event from a typed service error.
    #[must_use]
    pub fn error_from(err: &(impl ErrorCode + ?Sized)) -> Self {
        Self::Error {
            code: err.error_code().to_string(),
            message: err.to_string(),
            retryable: err.retryable(),
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_tag_names_are_kebab_case() {
        let json = serde_json::to_value(ClientEvent::ChatMessage { content: "hi".into() }).unwrap();
        assert_eq!(json["event"], "chat-message");
        assert_eq!(json["data"]["content"], "hi");

        let json = serde_json::to_value(ClientEvent::WebrtcIceCandidate {
            target: Uuid::nil(),
            candidate: serde_json::json!({"sdpMid": "0"}),
        })
        .unwrap();
        assert_eq!(json["event"], "webrtc-ice-candidate");
    }

    #[test]
    fn unit_variants_round_trip_without_data() {
        let json = serde_json::to_string(&ClientEvent::HeartbeatPing).unwrap();
        assert!(!json.contains("data"));

        let restored: ClientEvent = serde_json::from_str(r#"{"event":"typing-start"}"#).unwrap();
        assert_eq!(restored, ClientEvent::TypingStart);
    }

    #[test]
    fn join_room_optional_fields_default() {
        let restored: ClientEvent =
            serde_json::from_str(r#"{"event":"join-room","data":{"room":"R1"}}"#).unwrap();
        assert_eq!(
            restored,
            ClientEvent::JoinRoom { room: "R1".into(), display_name: None, user_agent: None }
        );
    }

    #[test]
    fn server_event_round_trip() {
        let original = ServerEvent::DrawOp {
            user_id: Uuid::new_v4(),
            op: Stroke {
                id: Uuid::new_v4(),
                color: "#1a1a1a".into(),
                width: 2.5,
                points: vec![Point { x: 0.0, y: 0.0 }, Point { x: 10.0, y: 4.0 }],
            },
        };
        let json = serde_json::to_string(&original).unwrap();
        let restored: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn timer_defaults_to_stopped_focus_session() {
        let timer = TimerState::default();
        assert!(!timer.running);
        assert_eq!(timer.remaining_secs, DEFAULT_FOCUS_SECS);
        assert_eq!(timer.mode, TimerMode::Focus);
        assert_eq!(timer.completed_sessions, 0);
    }

    #[test]
    fn error_from_typed() {
        #[derive(Debug, thiserror::Error)]
        #[error("room is full")]
        struct Full;

        impl ErrorCode for Full {
            fn error_code(&self) -> &'static str {
                "E_ROOM_FULL"
            }
        }

        let event = ServerEvent::error_from(&Full);
        let ServerEvent::Error { code, message, retryable } = event else {
            panic!("expected error event");
        };
        assert_eq!(code, "E_ROOM_FULL");
        assert_eq!(message, "room is full");
        assert!(!retryable);
    }

    #[test]
    fn now_ms_is_positive() {
        assert!(now_ms() > 0);
    }
}
