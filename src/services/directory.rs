//! Document-store boundary — read-only room and user lookups.
//!
//! SYSTEM CONTEXT
//! ==============
//! Rooms and users are owned by the surrounding application; this core only
//! reads them at join time (room validation, permission seeding) and never
//! writes. The `Directory` trait keeps the seam mockable so the whole relay
//! stack tests without a live database.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

// =============================================================================
// TYPES
// =============================================================================

/// Per-room feature switches, read once at join to build the permission
/// snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomSettings {
    pub allow_chat: bool,
    pub allow_whiteboard: bool,
    pub allow_screen_share: bool,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self { allow_chat: true, allow_whiteboard: true, allow_screen_share: true }
    }
}

/// Room configuration as stored by the surrounding application.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub id: Uuid,
    /// Human-entry alias ("study-4f2a" style short code).
    pub code: String,
    pub name: String,
    pub host_user_id: Option<Uuid>,
    /// 0 means unlimited.
    pub max_participants: u32,
    pub settings: RoomSettings,
}

/// User row as stored by the surrounding application.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

// =============================================================================
// TRAIT
// =============================================================================

/// Read-only lookups against the document store.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolve a room by UUID or human room code.
    async fn find_room(&self, room_ref: &str) -> Result<Option<RoomConfig>, DirectoryError>;

    /// Resolve a user by id.
    async fn find_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, DirectoryError>;
}

// =============================================================================
// POSTGRES IMPLEMENTATION
// =============================================================================

pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn find_room(&self, room_ref: &str) -> Result<Option<RoomConfig>, DirectoryError> {
        let by_id: Option<Uuid> = room_ref.parse().ok();

        let row = sqlx::query_as::<_, (Uuid, String, String, Option<Uuid>, i32, bool, bool, bool)>(
            "SELECT id, code, name, host_user_id, max_participants,
                    allow_chat, allow_whiteboard, allow_screen_share
             FROM rooms
             WHERE id = $1 OR code = $2",
        )
        .bind(by_id)
        .bind(room_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(id, code, name, host_user_id, max_participants, allow_chat, allow_whiteboard, allow_screen_share)| {
                RoomConfig {
                    id,
                    code,
                    name,
                    host_user_id,
                    max_participants: u32::try_from(max_participants).unwrap_or(0),
                    settings: RoomSettings { allow_chat, allow_whiteboard, allow_screen_share },
                }
            },
        ))
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, DirectoryError> {
        let row = sqlx::query_as::<_, (Uuid, String, Option<String>)>(
            "SELECT id, name, email FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, name, email)| UserRecord { id, name, email }))
    }
}
