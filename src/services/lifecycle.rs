//! Connection lifecycle — join, leave, transport loss, stale sweep.
//!
//! DESIGN
//! ======
//! Every transition between a transport and the room state goes through
//! here: join validation against the document store, registration,
//! snapshot-on-join, departure broadcasts, host transfer, and the periodic
//! sweep that demotes silent connections and tears down empty rooms.
//!
//! Registry mutations and their consequences are computed under the
//! registry lock and returned as plain data; the session-table side is
//! applied afterwards under its own lock. Neither lock is ever held across
//! the other or across I/O.
//!
//! LIFECYCLE
//! =========
//! 1. Join → directory lookup → capacity check → register → attach +
//!    snapshot (atomic) → `participant-joined` to the rest.
//! 2. Explicit leave → disconnected → `participant-left`, host transfer,
//!    grace clock if the room emptied.
//! 3. Transport loss → `reconnecting`; the sweep finishes the job if no
//!    re-registration arrives inside the stale window.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::event::{ErrorCode, ParticipantInfo, RoomSnapshot, ServerEvent};
use crate::services::directory::{DirectoryError, RoomConfig};
use crate::services::identity::Identity;
use crate::services::presence::{
    Connection, NewConnection, PermissionSet, PresenceRegistry, RegisterOutcome,
};
use crate::state::AppState;

// =============================================================================
// CONFIGURATION
// =============================================================================

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_STALE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_REVIVAL_WINDOW_SECS: u64 = 300;
const DEFAULT_GRACE_WINDOW_SECS: u64 = 60;

/// Lifecycle tuning knobs, loaded from environment variables.
#[derive(Clone, Copy)]
pub struct LifecycleConfig {
    /// How often the sweep task runs.
    pub sweep_interval: Duration,
    /// Active connections silent longer than this are demoted.
    pub stale_timeout: Duration,
    /// Disconnected records revivable within this window.
    pub revival_window: Duration,
    /// Empty room sessions are discarded after this window.
    pub grace_window: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            stale_timeout: Duration::from_secs(DEFAULT_STALE_TIMEOUT_SECS),
            revival_window: Duration::from_secs(DEFAULT_REVIVAL_WINDOW_SECS),
            grace_window: Duration::from_secs(DEFAULT_GRACE_WINDOW_SECS),
        }
    }
}

impl LifecycleConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            sweep_interval: Duration::from_secs(env_parse("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)),
            stale_timeout: Duration::from_secs(env_parse("STALE_TIMEOUT_SECS", DEFAULT_STALE_TIMEOUT_SECS)),
            revival_window: Duration::from_secs(env_parse("REVIVAL_WINDOW_SECS", DEFAULT_REVIVAL_WINDOW_SECS)),
            grace_window: Duration::from_secs(env_parse("GRACE_WINDOW_SECS", DEFAULT_GRACE_WINDOW_SECS)),
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

// =============================================================================
// JOIN
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("room is full")]
    RoomFull,
    #[error("room lookup failed: {0}")]
    Upstream(#[from] DirectoryError),
}

impl ErrorCode for JoinError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "E_ROOM_NOT_FOUND",
            Self::RoomFull => "E_ROOM_FULL",
            Self::Upstream(_) => "E_UPSTREAM_UNAVAILABLE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Upstream(_))
    }
}

/// Result of a successful join.
pub struct Joined {
    pub connection: Connection,
    pub snapshot: RoomSnapshot,
}

/// Permission snapshot for a joiner: room settings plus the host check,
/// computed once. The host of a room holds every permission.
fn permissions_for(room: &RoomConfig, identity: &Identity, first_in_room: bool) -> PermissionSet {
    let is_host = room.host_user_id.map_or(first_in_room, |host| host == identity.user_id);
    PermissionSet {
        can_share: room.settings.allow_screen_share || is_host,
        can_chat: room.settings.allow_chat || is_host,
        can_use_whiteboard: room.settings.allow_whiteboard || is_host,
        can_manage_room: is_host,
    }
}

/// Attach an identity to a room: validate, register, snapshot, announce.
///
/// # Errors
///
/// Join rejections are explicit and immediate: `RoomNotFound`, `RoomFull`
/// (capacity reached, reconnects exempt), or `Upstream` when the document
/// store is unavailable (retryable). The connection is never registered on
/// rejection.
pub async fn join(
    state: &AppState,
    room_ref: &str,
    identity: &Identity,
    tx: mpsc::Sender<ServerEvent>,
) -> Result<Joined, JoinError> {
    let room = state
        .directory
        .find_room(room_ref)
        .await?
        .ok_or_else(|| JoinError::RoomNotFound(room_ref.to_string()))?;

    // The document store is authoritative for authenticated display names;
    // guests carry their own.
    let display_name = if identity.is_guest {
        identity.display_name.clone()
    } else {
        state
            .directory
            .find_user(identity.user_id)
            .await?
            .map_or_else(|| identity.display_name.clone(), |user| user.name)
    };

    let registered = {
        let mut registry = state.registry.write().await;

        let resumes_existing = registry.find_active_by_user(room.id, identity.user_id).is_some();
        if !resumes_existing && room.max_participants > 0 {
            if registry.count_active(room.id) >= room.max_participants as usize {
                return Err(JoinError::RoomFull);
            }
        }

        let first_in_room = registry.count_active(room.id) == 0;
        registry.register(
            NewConnection {
                room_id: room.id,
                room_code: room.code.clone(),
                user_id: identity.user_id,
                display_name,
                is_guest: identity.is_guest,
                transport_id: Uuid::new_v4(),
                permissions: permissions_for(&room, identity, first_in_room),
            },
            state.config.revival_window,
        )
    };

    let conn = registered.connection;
    let participant = ParticipantInfo {
        user_id: conn.user_id,
        display_name: conn.display_name.clone(),
        is_guest: conn.is_guest,
        is_host: conn.permissions.can_manage_room,
        media: conn.media,
    };

    // Attach + snapshot atomically so the joiner neither misses nor
    // duplicates events relayed around the join instant.
    let snapshot = {
        let mut rooms = state.rooms.write().await;
        let session = rooms.get_or_create(room.id, &room.code, Instant::now());
        session.attach(conn.id, participant.clone(), tx);
        let snapshot = session.snapshot();

        // A reconnecting participant never left the room view; only fresh
        // joins and revivals are announced.
        if registered.outcome != RegisterOutcome::Reconnected {
            session.broadcast(&ServerEvent::ParticipantJoined { participant }, Some(conn.id));
        }
        snapshot
    };

    info!(conn_id = %conn.id, room_id = %room.id, user_id = %conn.user_id, outcome = ?registered.outcome, "joined room");
    Ok(Joined { connection: conn, snapshot })
}

// =============================================================================
// DEPARTURE
// =============================================================================

/// Registry-side consequences of one connection's departure.
struct Departure {
    conn: Connection,
    new_host: Option<Connection>,
    room_emptied: bool,
}

/// Compute host transfer and emptiness under the registry lock. Host
/// permission moves to the oldest remaining active connection, but only
/// when the departing connection held the sole host permission.
fn departure_locked(registry: &mut PresenceRegistry, conn: Connection) -> Departure {
    let remaining = registry.list_active(conn.room_id);

    let mut new_host = None;
    if conn.permissions.can_manage_room && !remaining.is_empty() {
        let no_other_host = remaining.iter().all(|c| !c.permissions.can_manage_room);
        if no_other_host {
            new_host = registry.promote_to_host(remaining[0].id);
        }
    }

    Departure { room_emptied: remaining.is_empty(), conn, new_host }
}

/// Apply a departure to the room session: detach, announce, transfer.
async fn announce_departure(state: &AppState, departure: Departure, now: Instant) {
    let Departure { conn, new_host, room_emptied } = departure;

    let mut rooms = state.rooms.write().await;
    let Some(session) = rooms.get_mut(conn.room_id) else {
        return;
    };

    session.detach(conn.id, conn.user_id);
    session.broadcast(
        &ServerEvent::ParticipantLeft { user_id: conn.user_id, display_name: conn.display_name },
        None,
    );

    if let Some(host) = new_host {
        session.set_participant_host(host.user_id);
        session.broadcast(
            &ServerEvent::HostChanged { user_id: host.user_id, display_name: host.display_name },
            None,
        );
    }

    if room_emptied {
        session.mark_empty(now);
    }
}

/// Graceful leave: terminal for the connection record, announced at once.
/// The transport id identifies the caller's socket; a socket whose record
/// was already taken over by a reconnect cannot disconnect it.
pub async fn leave(state: &AppState, conn_id: Uuid, transport_id: Uuid) {
    let departure = {
        let mut registry = state.registry.write().await;
        let owns_record = registry.get(conn_id).is_some_and(|c| c.transport_id == transport_id);
        if !owns_record {
            return;
        }
        let Some(conn) = registry.mark_disconnected(conn_id) else {
            return;
        };
        departure_locked(&mut registry, conn)
    };
    announce_departure(state, departure, Instant::now()).await;
}

/// Abrupt transport loss: the record stays active as `reconnecting` and
/// keeps its room seat; only the dead sender is dropped. The stale sweep
/// completes the departure if no re-registration arrives in time.
pub async fn transport_lost(state: &AppState, conn_id: Uuid, transport_id: Uuid) {
    let room_id = {
        let mut registry = state.registry.write().await;
        let Some(conn) = registry.get(conn_id) else {
            return;
        };
        if conn.transport_id != transport_id {
            // Superseded by a reconnect; the record belongs to a live socket.
            return;
        }
        let room_id = conn.room_id;
        registry.mark_reconnecting(conn_id, transport_id);
        room_id
    };

    if let Some(session) = state.rooms.write().await.get_mut(room_id) {
        session.remove_sender(conn_id);
    }
}

// =============================================================================
// STALE SWEEP
// =============================================================================

/// One sweep cycle: demote silent connections, announce their departures,
/// prune expired disconnected records, tear down expired empty sessions.
pub async fn sweep(state: &AppState) {
    sweep_at(state, Instant::now()).await;
}

pub(crate) async fn sweep_at(state: &AppState, now: Instant) {
    let departures: Vec<Departure> = {
        let mut registry = state.registry.write().await;
        let swept = registry.sweep_stale_at(state.config.stale_timeout, now);
        let departures = swept
            .into_iter()
            .map(|conn| departure_locked(&mut registry, conn))
            .collect();
        registry.prune_disconnected_at(state.config.revival_window, now);
        departures
    };

    for departure in departures {
        announce_departure(state, departure, now).await;
    }

    state.rooms.write().await.teardown_expired(state.config.grace_window, now);
}

/// Spawn the periodic sweep task. Returns a handle for shutdown.
pub fn spawn_sweep_task(state: AppState) -> JoinHandle<()> {
    let interval = state.config.sweep_interval;
    info!(
        interval_secs = interval.as_secs(),
        stale_timeout_secs = state.config.stale_timeout.as_secs(),
        "stale sweep configured"
    );
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            sweep(&state).await;
        }
    })
}

#[cfg(test)]
#[path = "lifecycle_test.rs"]
mod tests;
