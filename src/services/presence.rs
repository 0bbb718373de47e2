//! Presence registry — the authoritative table of live connections.
//!
//! DESIGN
//! ======
//! One `Connection` record per participant per room, keyed by connection id
//! with a `(room_id, user_id)` index enforcing at most one active record per
//! pair: a re-registration resolves to the existing record instead of
//! creating a second. All mutation is synchronous; callers hold the
//! registry lock for exactly one operation and never across I/O.
//!
//! LIFECYCLE
//! =========
//! `connecting → connected` at registration; `connected → reconnecting`
//! when the transport drops without a leave; `→ disconnected` on explicit
//! leave or stale sweep. Disconnected records linger for a revival window
//! so a returning client resumes its identity, then are pruned.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::info;
use uuid::Uuid;

use crate::event::MediaState;

// =============================================================================
// TYPES
// =============================================================================

/// Connection status state machine (see module docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl ConnectionStatus {
    /// Active connections hold a room seat and receive fanout.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connected | Self::Reconnecting)
    }
}

/// Permission snapshot, computed once at join from room settings plus the
/// host check. Never re-derived per event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PermissionSet {
    pub can_share: bool,
    pub can_chat: bool,
    pub can_use_whiteboard: bool,
    pub can_manage_room: bool,
}

/// One live transport session for one participant in one room.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    /// Changes on every reconnect; the connection id does not.
    pub transport_id: Uuid,
    pub room_id: Uuid,
    pub room_code: String,
    pub user_id: Uuid,
    pub display_name: String,
    pub is_guest: bool,
    pub status: ConnectionStatus,
    pub media: MediaState,
    pub permissions: PermissionSet,
    pub connected_at: Instant,
    pub last_seen: Instant,
    pub disconnected_at: Option<Instant>,
}

impl Connection {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Parameters for a registration attempt.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub room_id: Uuid,
    pub room_code: String,
    pub user_id: Uuid,
    pub display_name: String,
    pub is_guest: bool,
    pub transport_id: Uuid,
    pub permissions: PermissionSet,
}

/// How a registration resolved against existing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// No prior record for this (room, user); a fresh connection was created.
    Created,
    /// An active record existed; it was updated in place with the new
    /// transport. The participant never left the room view.
    Reconnected,
    /// A disconnected record inside the revival window was brought back.
    /// The participant had already been announced as departed.
    Revived,
}

/// Result of `register`: the connection as stored, plus how it resolved.
#[derive(Debug, Clone)]
pub struct Registered {
    pub connection: Connection,
    pub outcome: RegisterOutcome,
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Authoritative table of all connections and their status.
#[derive(Default)]
pub struct PresenceRegistry {
    connections: HashMap<Uuid, Connection>,
    /// (room id, user id) → connection id. At most one entry per pair.
    by_room_user: HashMap<(Uuid, Uuid), Uuid>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for (room, user). Resolves to the existing
    /// record on reconnect or revival instead of creating a duplicate.
    pub fn register(&mut self, new: NewConnection, revival_window: Duration) -> Registered {
        self.register_at(new, revival_window, Instant::now())
    }

    pub(crate) fn register_at(
        &mut self,
        new: NewConnection,
        revival_window: Duration,
        now: Instant,
    ) -> Registered {
        let key = (new.room_id, new.user_id);

        if let Some(conn_id) = self.by_room_user.get(&key).copied() {
            if let Some(conn) = self.connections.get_mut(&conn_id) {
                if conn.is_active() {
                    // Reconnect: same logical connection, new transport.
                    conn.transport_id = new.transport_id;
                    conn.status = ConnectionStatus::Connected;
                    conn.last_seen = now;
                    conn.disconnected_at = None;
                    conn.display_name = new.display_name;
                    // Host permission won by in-session transfer outlives
                    // the transport that earned it.
                    let keep_host = conn.permissions.can_manage_room;
                    conn.permissions = new.permissions;
                    conn.permissions.can_manage_room |= keep_host;
                    info!(conn_id = %conn.id, room_id = %conn.room_id, "presence: reconnect");
                    return Registered { connection: conn.clone(), outcome: RegisterOutcome::Reconnected };
                }

                let revivable = conn
                    .disconnected_at
                    .is_some_and(|at| now.duration_since(at) <= revival_window);
                if revivable {
                    conn.transport_id = new.transport_id;
                    conn.status = ConnectionStatus::Connected;
                    conn.last_seen = now;
                    conn.disconnected_at = None;
                    conn.display_name = new.display_name;
                    conn.permissions = new.permissions;
                    info!(conn_id = %conn.id, room_id = %conn.room_id, "presence: revived");
                    return Registered { connection: conn.clone(), outcome: RegisterOutcome::Revived };
                }

                // Past the revival window: retire the stale record.
                self.connections.remove(&conn_id);
            }
            self.by_room_user.remove(&key);
        }

        let mut conn = Connection {
            id: Uuid::new_v4(),
            transport_id: new.transport_id,
            room_id: new.room_id,
            room_code: new.room_code,
            user_id: new.user_id,
            display_name: new.display_name,
            is_guest: new.is_guest,
            status: ConnectionStatus::Connecting,
            media: MediaState::default(),
            permissions: new.permissions,
            connected_at: now,
            last_seen: now,
            disconnected_at: None,
        };
        conn.status = ConnectionStatus::Connected;
        let registered = Registered { connection: conn.clone(), outcome: RegisterOutcome::Created };
        info!(conn_id = %conn.id, room_id = %conn.room_id, user_id = %conn.user_id, "presence: registered");
        self.by_room_user.insert(key, conn.id);
        self.connections.insert(conn.id, conn);
        registered
    }

    /// Refresh liveness. Called on every inbound event and heartbeat.
    pub fn touch(&mut self, conn_id: Uuid) {
        self.touch_at(conn_id, Instant::now());
    }

    pub(crate) fn touch_at(&mut self, conn_id: Uuid, now: Instant) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.last_seen = now;
        }
    }

    /// Transport dropped without a leave: keep the record active as
    /// `reconnecting` until it re-registers or the sweep demotes it.
    /// A transport that was already superseded by a reconnect is ignored.
    pub fn mark_reconnecting(&mut self, conn_id: Uuid, transport_id: Uuid) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            if conn.status == ConnectionStatus::Connected && conn.transport_id == transport_id {
                conn.status = ConnectionStatus::Reconnecting;
                info!(conn_id = %conn.id, room_id = %conn.room_id, "presence: transport lost");
            }
        }
    }

    /// Terminal transition for this record. The record is retained for the
    /// revival window rather than deleted.
    pub fn mark_disconnected(&mut self, conn_id: Uuid) -> Option<Connection> {
        self.mark_disconnected_at(conn_id, Instant::now())
    }

    pub(crate) fn mark_disconnected_at(&mut self, conn_id: Uuid, now: Instant) -> Option<Connection> {
        let conn = self.connections.get_mut(&conn_id)?;
        if !conn.is_active() {
            return None;
        }
        conn.status = ConnectionStatus::Disconnected;
        conn.disconnected_at = Some(now);
        info!(conn_id = %conn.id, room_id = %conn.room_id, "presence: disconnected");
        Some(conn.clone())
    }

    /// Demote active connections whose `last_seen` is older than the
    /// timeout window. This is the failure detector for clients that
    /// vanished without a clean disconnect.
    pub fn sweep_stale(&mut self, timeout_window: Duration) -> Vec<Connection> {
        self.sweep_stale_at(timeout_window, Instant::now())
    }

    pub(crate) fn sweep_stale_at(&mut self, timeout_window: Duration, now: Instant) -> Vec<Connection> {
        let stale: Vec<Uuid> = self
            .connections
            .values()
            .filter(|c| c.is_active() && now.duration_since(c.last_seen) > timeout_window)
            .map(|c| c.id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.mark_disconnected_at(id, now))
            .collect()
    }

    /// Drop disconnected records past the revival window.
    pub fn prune_disconnected(&mut self, revival_window: Duration) {
        self.prune_disconnected_at(revival_window, Instant::now());
    }

    pub(crate) fn prune_disconnected_at(&mut self, revival_window: Duration, now: Instant) {
        let expired: Vec<(Uuid, (Uuid, Uuid))> = self
            .connections
            .values()
            .filter(|c| {
                c.disconnected_at
                    .is_some_and(|at| now.duration_since(at) > revival_window)
            })
            .map(|c| (c.id, (c.room_id, c.user_id)))
            .collect();

        for (conn_id, key) in expired {
            self.connections.remove(&conn_id);
            // Only clear the index if it still points at this record.
            if self.by_room_user.get(&key) == Some(&conn_id) {
                self.by_room_user.remove(&key);
            }
        }
    }

    #[must_use]
    pub fn get(&self, conn_id: Uuid) -> Option<&Connection> {
        self.connections.get(&conn_id)
    }

    /// Active connections in a room, oldest first. The ordering is the
    /// host-transfer tie-break.
    #[must_use]
    pub fn list_active(&self, room_id: Uuid) -> Vec<Connection> {
        let mut active: Vec<Connection> = self
            .connections
            .values()
            .filter(|c| c.room_id == room_id && c.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        active
    }

    #[must_use]
    pub fn count_active(&self, room_id: Uuid) -> usize {
        self.connections
            .values()
            .filter(|c| c.room_id == room_id && c.is_active())
            .count()
    }

    #[must_use]
    pub fn find_active_by_user(&self, room_id: Uuid, user_id: Uuid) -> Option<&Connection> {
        self.by_room_user
            .get(&(room_id, user_id))
            .and_then(|id| self.connections.get(id))
            .filter(|c| c.is_active())
    }

    /// Overwrite a connection's client-reported media flags.
    pub fn set_media(&mut self, conn_id: Uuid, media: MediaState) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.media = media;
        }
    }

    /// Grant room-management permission, returning the updated record.
    pub fn promote_to_host(&mut self, conn_id: Uuid) -> Option<Connection> {
        let conn = self.connections.get_mut(&conn_id)?;
        conn.permissions.can_manage_room = true;
        info!(conn_id = %conn.id, room_id = %conn.room_id, "presence: promoted to host");
        Some(conn.clone())
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
