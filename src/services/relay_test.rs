use super::*;

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::event::{Point, TimerMode};
use crate::services::presence::NewConnection;
use crate::state::test_helpers;

const REVIVAL: Duration = Duration::from_secs(300);

fn all_permissions() -> PermissionSet {
    PermissionSet { can_share: true, can_chat: true, can_use_whiteboard: true, can_manage_room: true }
}

fn member_permissions() -> PermissionSet {
    PermissionSet { can_share: true, can_chat: true, can_use_whiteboard: true, can_manage_room: false }
}

/// Register a connection and attach it to the room session directly.
async fn seed_member(
    state: &AppState,
    room_id: Uuid,
    name: &str,
    permissions: PermissionSet,
) -> (Uuid, Uuid, mpsc::Receiver<ServerEvent>) {
    let user_id = Uuid::new_v4();
    let registered = state.registry.write().await.register(
        NewConnection {
            room_id,
            room_code: "R1".into(),
            user_id,
            display_name: name.into(),
            is_guest: false,
            transport_id: Uuid::new_v4(),
            permissions,
        },
        REVIVAL,
    );

    let (tx, rx) = mpsc::channel(16);
    let mut rooms = state.rooms.write().await;
    let session = rooms.get_or_create(room_id, "R1", Instant::now());
    session.attach(
        registered.connection.id,
        crate::event::ParticipantInfo {
            user_id,
            display_name: name.into(),
            is_guest: false,
            is_host: permissions.can_manage_room,
            media: MediaState::default(),
        },
        tx,
    );

    (registered.connection.id, user_id, rx)
}

async fn recv_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("event receive timed out")
        .expect("channel closed")
}

async fn assert_channel_empty(rx: &mut mpsc::Receiver<ServerEvent>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected channel to remain empty"
    );
}

fn stroke() -> Stroke {
    Stroke {
        id: Uuid::new_v4(),
        color: "#333".into(),
        width: 1.5,
        points: vec![Point { x: 0.0, y: 0.0 }, Point { x: 5.0, y: 5.0 }],
    }
}

#[tokio::test]
async fn chat_fans_out_to_peers_but_not_origin() {
    let state = test_helpers::test_app_state(Vec::new());
    let room_id = Uuid::new_v4();
    let (conn_a, user_a, mut rx_a) = seed_member(&state, room_id, "alice", member_permissions()).await;
    let (_conn_b, _user_b, mut rx_b) = seed_member(&state, room_id, "bob", member_permissions()).await;
    let (_conn_c, _user_c, mut rx_c) = seed_member(&state, room_id, "carol", member_permissions()).await;

    relay(&state, conn_a, RoomEvent::Chat { content: "hi all".into() })
        .await
        .expect("chat should relay");

    for rx in [&mut rx_b, &mut rx_c] {
        let ServerEvent::ChatMessage(message) = recv_event(rx).await else {
            panic!("expected chat-message");
        };
        assert_eq!(message.content, "hi all");
        assert_eq!(message.user_id, user_a);
        assert_eq!(message.display_name, "alice");
    }
    assert_channel_empty(&mut rx_a).await;

    // The message also landed in the backlog.
    let rooms = state.rooms.read().await;
    let snapshot = rooms.get(room_id).unwrap().snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].content, "hi all");
}

#[tokio::test]
async fn typing_indicator_is_transient() {
    let state = test_helpers::test_app_state(Vec::new());
    let room_id = Uuid::new_v4();
    let (conn_a, user_a, _rx_a) = seed_member(&state, room_id, "alice", member_permissions()).await;
    let (_conn_b, _user_b, mut rx_b) = seed_member(&state, room_id, "bob", member_permissions()).await;

    relay(&state, conn_a, RoomEvent::TypingStart).await.unwrap();

    assert_eq!(recv_event(&mut rx_b).await, ServerEvent::TypingStart { user_id: user_a });

    // No durable room-session effect.
    let rooms = state.rooms.read().await;
    assert!(rooms.get(room_id).unwrap().snapshot().messages.is_empty());
}

#[tokio::test]
async fn timer_control_requires_manage_permission() {
    let state = test_helpers::test_app_state(Vec::new());
    let room_id = Uuid::new_v4();
    let (_conn_h, _user_h, mut rx_h) = seed_member(&state, room_id, "host", all_permissions()).await;
    let (conn_b, _user_b, _rx_b) = seed_member(&state, room_id, "bob", member_permissions()).await;

    let timer = TimerState {
        running: true,
        remaining_secs: 10,
        mode: TimerMode::Focus,
        completed_sessions: 0,
    };
    let result = relay(&state, conn_b, RoomEvent::Timer { timer }).await;

    assert!(matches!(result, Err(RelayError::Forbidden(_))));
    assert_eq!(result.unwrap_err().error_code(), "E_FORBIDDEN");

    // Timer unchanged, nothing fanned out.
    let rooms = state.rooms.read().await;
    assert_eq!(rooms.get(room_id).unwrap().snapshot().timer, TimerState::default());
    drop(rooms);
    assert_channel_empty(&mut rx_h).await;
}

#[tokio::test]
async fn host_timer_control_replaces_state_and_fans_out() {
    let state = test_helpers::test_app_state(Vec::new());
    let room_id = Uuid::new_v4();
    let (conn_h, _user_h, _rx_h) = seed_member(&state, room_id, "host", all_permissions()).await;
    let (_conn_b, _user_b, mut rx_b) = seed_member(&state, room_id, "bob", member_permissions()).await;

    let timer = TimerState {
        running: true,
        remaining_secs: 1500,
        mode: TimerMode::Focus,
        completed_sessions: 2,
    };
    relay(&state, conn_h, RoomEvent::Timer { timer }).await.unwrap();

    assert_eq!(recv_event(&mut rx_b).await, ServerEvent::TimerState { timer });
    let rooms = state.rooms.read().await;
    assert_eq!(rooms.get(room_id).unwrap().snapshot().timer, timer);
}

#[tokio::test]
async fn draw_requires_whiteboard_permission() {
    let state = test_helpers::test_app_state(Vec::new());
    let room_id = Uuid::new_v4();
    let mut no_board = member_permissions();
    no_board.can_use_whiteboard = false;
    let (conn_a, _user_a, _rx_a) = seed_member(&state, room_id, "alice", no_board).await;

    let result = relay(&state, conn_a, RoomEvent::Draw { op: stroke() }).await;
    assert!(matches!(result, Err(RelayError::Forbidden(_))));

    let rooms = state.rooms.read().await;
    assert!(rooms.get(room_id).unwrap().snapshot().strokes.is_empty());
}

#[tokio::test]
async fn draw_applies_to_board_and_fans_out() {
    let state = test_helpers::test_app_state(Vec::new());
    let room_id = Uuid::new_v4();
    let (conn_a, user_a, _rx_a) = seed_member(&state, room_id, "alice", member_permissions()).await;
    let (_conn_b, _user_b, mut rx_b) = seed_member(&state, room_id, "bob", member_permissions()).await;

    let op = stroke();
    relay(&state, conn_a, RoomEvent::Draw { op: op.clone() }).await.unwrap();

    assert_eq!(recv_event(&mut rx_b).await, ServerEvent::DrawOp { user_id: user_a, op: op.clone() });

    relay(&state, conn_a, RoomEvent::DrawClear).await.unwrap();
    assert_eq!(recv_event(&mut rx_b).await, ServerEvent::DrawClear { user_id: user_a });

    let rooms = state.rooms.read().await;
    assert!(rooms.get(room_id).unwrap().snapshot().strokes.is_empty());
}

#[tokio::test]
async fn note_mutation_updates_snapshot() {
    let state = test_helpers::test_app_state(Vec::new());
    let room_id = Uuid::new_v4();
    let (conn_a, _user_a, _rx_a) = seed_member(&state, room_id, "alice", member_permissions()).await;
    let note_id = Uuid::new_v4();

    relay(&state, conn_a, RoomEvent::Note { note_id, content: "agenda".into() }).await.unwrap();
    relay(&state, conn_a, RoomEvent::Note { note_id, content: "agenda v2".into() }).await.unwrap();

    let rooms = state.rooms.read().await;
    let snapshot = rooms.get(room_id).unwrap().snapshot();
    assert_eq!(snapshot.notes.len(), 1);
    assert_eq!(snapshot.notes[0].content, "agenda v2");
}

#[tokio::test]
async fn media_toggle_updates_registry_and_participant_view() {
    let state = test_helpers::test_app_state(Vec::new());
    let room_id = Uuid::new_v4();
    let (conn_a, user_a, _rx_a) = seed_member(&state, room_id, "alice", member_permissions()).await;
    let (_conn_b, _user_b, mut rx_b) = seed_member(&state, room_id, "bob", member_permissions()).await;

    relay(&state, conn_a, RoomEvent::MediaToggle { video: true, audio: false }).await.unwrap();

    let expected = MediaState { video: true, audio: false, screen_share: false };
    assert_eq!(
        recv_event(&mut rx_b).await,
        ServerEvent::MediaToggled { user_id: user_a, media: expected }
    );

    let registry = state.registry.read().await;
    assert_eq!(registry.get(conn_a).unwrap().media, expected);
    drop(registry);

    let rooms = state.rooms.read().await;
    let participant = rooms.get(room_id).unwrap().participant(user_a).unwrap().clone();
    assert_eq!(participant.media, expected);
}

#[tokio::test]
async fn screen_share_requires_share_permission() {
    let state = test_helpers::test_app_state(Vec::new());
    let room_id = Uuid::new_v4();
    let mut no_share = member_permissions();
    no_share.can_share = false;
    let (conn_a, _user_a, _rx_a) = seed_member(&state, room_id, "alice", no_share).await;

    let result = relay(&state, conn_a, RoomEvent::ScreenShare { active: true }).await;
    assert!(matches!(result, Err(RelayError::Forbidden(_))));

    // Last-known-good media state untouched on rejection.
    let registry = state.registry.read().await;
    assert!(!registry.get(conn_a).unwrap().media.screen_share);
}

#[tokio::test]
async fn hand_raise_needs_no_permission() {
    let state = test_helpers::test_app_state(Vec::new());
    let room_id = Uuid::new_v4();
    let none = PermissionSet::default();
    let (conn_a, user_a, _rx_a) = seed_member(&state, room_id, "alice", none).await;
    let (_conn_b, _user_b, mut rx_b) = seed_member(&state, room_id, "bob", member_permissions()).await;

    relay(&state, conn_a, RoomEvent::HandRaise { raised: true }).await.unwrap();

    assert_eq!(recv_event(&mut rx_b).await, ServerEvent::HandRaised { user_id: user_a, raised: true });
}

#[tokio::test]
async fn unknown_connection_is_rejected() {
    let state = test_helpers::test_app_state(Vec::new());

    let result = relay(&state, Uuid::new_v4(), RoomEvent::TypingStart).await;

    assert!(matches!(result, Err(RelayError::UnknownConnection(_))));
    assert_eq!(result.unwrap_err().error_code(), "E_UNKNOWN_CONNECTION");
}

#[tokio::test]
async fn relay_from_a_disconnected_connection_is_rejected() {
    let state = test_helpers::test_app_state(Vec::new());
    let room_id = Uuid::new_v4();
    let (conn_a, _user_a, _rx_a) = seed_member(&state, room_id, "alice", member_permissions()).await;

    state.registry.write().await.mark_disconnected(conn_a);

    let result = relay(&state, conn_a, RoomEvent::Chat { content: "ghost".into() }).await;
    assert!(matches!(result, Err(RelayError::UnknownConnection(_))));
}

#[tokio::test]
async fn events_from_one_origin_arrive_in_order() {
    let state = test_helpers::test_app_state(Vec::new());
    let room_id = Uuid::new_v4();
    let (conn_a, _user_a, _rx_a) = seed_member(&state, room_id, "alice", member_permissions()).await;
    let (_conn_b, _user_b, mut rx_b) = seed_member(&state, room_id, "bob", member_permissions()).await;

    for i in 0..3 {
        relay(&state, conn_a, RoomEvent::Chat { content: format!("e{i}") }).await.unwrap();
    }

    for i in 0..3 {
        let ServerEvent::ChatMessage(message) = recv_event(&mut rx_b).await else {
            panic!("expected chat-message");
        };
        assert_eq!(message.content, format!("e{i}"));
    }
}
