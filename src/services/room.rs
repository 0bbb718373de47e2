//! Room session table — live, in-memory state of each active room.
//!
//! DESIGN
//! ======
//! A `RoomSession` exists while its room has at least one active connection
//! (plus a grace window after the last one departs). It owns the participant
//! view, the bounded chat backlog, the whiteboard stroke log, the notes
//! snapshot, the shared timer, and the per-connection outbound senders.
//! Keeping senders next to the room state makes attach+snapshot and
//! apply+fanout each a single atomic mutation under the table lock, which is
//! what guarantees a joiner's snapshot neither misses nor duplicates events.
//!
//! ERROR HANDLING
//! ==============
//! Delivery is best-effort per target: a full or closed channel is logged
//! and skipped, never allowed to fail the other targets or the caller.
//! Session contents are ephemeral; teardown discards them.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::event::{ChatMessage, MediaState, Note, ParticipantInfo, RoomSnapshot, ServerEvent, Stroke, TimerState};

/// Chat messages retained for late joiners. Oldest evicted past the cap.
pub const MESSAGE_BACKLOG_CAP: usize = 100;

/// Stroke operations retained since the last board clear. An over-cap board
/// degrades (oldest strokes drop) rather than erroring.
pub const STROKE_CAP: usize = 4096;

// =============================================================================
// ROOM SESSION
// =============================================================================

struct SessionParticipant {
    conn_id: Uuid,
    info: ParticipantInfo,
}

/// The in-memory aggregate state of one room.
pub struct RoomSession {
    pub room_id: Uuid,
    pub room_code: String,
    /// user id → last-known connection summary. Derived view over the
    /// presence registry, updated in lockstep by the lifecycle manager.
    participants: HashMap<Uuid, SessionParticipant>,
    /// connection id → outbound sender for that transport.
    senders: HashMap<Uuid, mpsc::Sender<ServerEvent>>,
    messages: VecDeque<ChatMessage>,
    strokes: VecDeque<Stroke>,
    notes: HashMap<Uuid, String>,
    timer: TimerState,
    /// Set when the last active connection departs; drives grace teardown.
    empty_since: Option<Instant>,
}

impl RoomSession {
    fn new(room_id: Uuid, room_code: String, now: Instant) -> Self {
        Self {
            room_id,
            room_code,
            participants: HashMap::new(),
            senders: HashMap::new(),
            messages: VecDeque::new(),
            strokes: VecDeque::new(),
            notes: HashMap::new(),
            timer: TimerState::default(),
            empty_since: Some(now),
        }
    }

    /// Attach a connection: participant view entry plus outbound sender.
    /// Re-attaching the same connection id replaces the sender (reconnect).
    pub fn attach(&mut self, conn_id: Uuid, info: ParticipantInfo, tx: mpsc::Sender<ServerEvent>) {
        self.senders.insert(conn_id, tx);
        self.participants.insert(info.user_id, SessionParticipant { conn_id, info });
        self.empty_since = None;
    }

    /// Remove a departed connection from the session. The participant entry
    /// is only removed if it still belongs to this connection.
    pub fn detach(&mut self, conn_id: Uuid, user_id: Uuid) {
        self.senders.remove(&conn_id);
        if self.participants.get(&user_id).is_some_and(|p| p.conn_id == conn_id) {
            self.participants.remove(&user_id);
        }
    }

    /// Drop only the transport sender (connection lost but still active as
    /// `reconnecting`); the participant stays visible in the room.
    pub fn remove_sender(&mut self, conn_id: Uuid) {
        self.senders.remove(&conn_id);
    }

    /// Start the grace-teardown clock. Called by the lifecycle manager once
    /// the registry shows no active connection left in the room.
    pub fn mark_empty(&mut self, now: Instant) {
        self.empty_since = Some(now);
    }

    pub fn append_message(&mut self, message: ChatMessage) {
        self.messages.push_back(message);
        while self.messages.len() > MESSAGE_BACKLOG_CAP {
            self.messages.pop_front();
        }
    }

    pub fn apply_draw(&mut self, op: Stroke) {
        self.strokes.push_back(op);
        while self.strokes.len() > STROKE_CAP {
            self.strokes.pop_front();
        }
    }

    pub fn clear_board(&mut self) {
        self.strokes.clear();
    }

    pub fn upsert_note(&mut self, note_id: Uuid, content: String) {
        self.notes.insert(note_id, content);
    }

    /// Whole-state replace. Authorization happens in the relay.
    pub fn set_timer(&mut self, timer: TimerState) {
        self.timer = timer;
    }

    pub fn set_participant_media(&mut self, user_id: Uuid, media: MediaState) {
        if let Some(p) = self.participants.get_mut(&user_id) {
            p.info.media = media;
        }
    }

    pub fn set_participant_host(&mut self, user_id: Uuid) {
        if let Some(p) = self.participants.get_mut(&user_id) {
            p.info.is_host = true;
        }
    }

    /// Everything a newly joined connection needs to catch up.
    #[must_use]
    pub fn snapshot(&self) -> RoomSnapshot {
        let mut participants: Vec<ParticipantInfo> =
            self.participants.values().map(|p| p.info.clone()).collect();
        participants.sort_by_key(|p| p.user_id);

        let mut notes: Vec<Note> = self
            .notes
            .iter()
            .map(|(note_id, content)| Note { note_id: *note_id, content: content.clone() })
            .collect();
        notes.sort_by_key(|n| n.note_id);

        RoomSnapshot {
            room_id: self.room_id,
            room_code: self.room_code.clone(),
            participants,
            messages: self.messages.iter().cloned().collect(),
            strokes: self.strokes.iter().cloned().collect(),
            notes,
            timer: self.timer,
        }
    }

    /// Deliver an event to every attached connection, optionally excluding
    /// one. A failed target is logged and skipped.
    pub fn broadcast(&self, event: &ServerEvent, exclude: Option<Uuid>) {
        for (conn_id, tx) in &self.senders {
            if exclude == Some(*conn_id) {
                continue;
            }
            if let Err(e) = tx.try_send(event.clone()) {
                warn!(conn_id = %conn_id, room_id = %self.room_id, error = %e, "delivery failed; skipping target");
            }
        }
    }

    /// Deliver to a single participant by user id. Returns false when the
    /// target has no attached transport; callers decide whether that is
    /// silent (signaling) or worth an error.
    pub fn unicast(&self, user_id: Uuid, event: &ServerEvent) -> bool {
        let Some(tx) = self
            .participants
            .get(&user_id)
            .and_then(|p| self.senders.get(&p.conn_id))
        else {
            return false;
        };
        if let Err(e) = tx.try_send(event.clone()) {
            warn!(user_id = %user_id, room_id = %self.room_id, error = %e, "unicast delivery failed");
            return false;
        }
        true
    }

    #[must_use]
    pub fn has_transports(&self) -> bool {
        !self.senders.is_empty()
    }

    #[must_use]
    pub fn participant(&self, user_id: Uuid) -> Option<&ParticipantInfo> {
        self.participants.get(&user_id).map(|p| &p.info)
    }
}

// =============================================================================
// SESSION TABLE
// =============================================================================

/// All live room sessions, keyed by room id. Created lazily on first join,
/// discarded by the lifecycle manager once empty past the grace window.
#[derive(Default)]
pub struct RoomSessionTable {
    rooms: HashMap<Uuid, RoomSession>,
}

impl RoomSessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, room_id: Uuid, room_code: &str, now: Instant) -> &mut RoomSession {
        self.rooms
            .entry(room_id)
            .or_insert_with(|| RoomSession::new(room_id, room_code.to_string(), now))
    }

    #[must_use]
    pub fn get(&self, room_id: Uuid) -> Option<&RoomSession> {
        self.rooms.get(&room_id)
    }

    pub fn get_mut(&mut self, room_id: Uuid) -> Option<&mut RoomSession> {
        self.rooms.get_mut(&room_id)
    }

    /// Discard sessions that have been empty past the grace window.
    /// Backlog, strokes, and notes die with the session.
    pub fn teardown_expired(&mut self, grace_window: Duration, now: Instant) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .rooms
            .values()
            .filter(|s| {
                !s.has_transports()
                    && s.empty_since
                        .is_some_and(|since| now.duration_since(since) > grace_window)
            })
            .map(|s| s.room_id)
            .collect();

        for room_id in &expired {
            self.rooms.remove(room_id);
            info!(%room_id, "room session torn down");
        }
        expired
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
