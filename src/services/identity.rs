//! Auth boundary — resolve an opaque credential into a participant identity.
//!
//! DESIGN
//! ======
//! The upgrade request may carry a session token (validated against the
//! `sessions` table) or nothing, in which case the connection is a guest
//! with a synthesized stable user id. A returning guest can present its id
//! back for reconnect continuity; the id is advisory presence state, not a
//! security boundary, so it is accepted unverified.

use rand::Rng;
use sqlx::PgPool;
use uuid::Uuid;

// =============================================================================
// TYPES
// =============================================================================

/// The identity the presence registry registers. Opaque to the core beyond
/// these three fields.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
    pub is_guest: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid or expired session token")]
    InvalidToken,
    #[error("identity lookup failed: {0}")]
    Upstream(#[from] sqlx::Error),
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// Resolve credentials into an identity.
///
/// # Errors
///
/// `InvalidToken` when a presented token does not match a live session;
/// `Upstream` when the lookup itself fails (retryable by the client).
pub async fn resolve_identity(
    pool: &PgPool,
    token: Option<&str>,
    guest_id: Option<Uuid>,
) -> Result<Identity, IdentityError> {
    if let Some(token) = token {
        let row = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT u.id, u.name
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token = $1 AND s.expires_at > now()",
        )
        .bind(token)
        .fetch_optional(pool)
        .await?;

        let Some((user_id, name)) = row else {
            return Err(IdentityError::InvalidToken);
        };
        return Ok(Identity { user_id, display_name: name, is_guest: false });
    }

    // Guest path: no database round-trip.
    Ok(Identity {
        user_id: guest_id.unwrap_or_else(Uuid::new_v4),
        display_name: guest_name(),
        is_guest: true,
    })
}

/// Default display name for guests who never supply one.
#[must_use]
pub fn guest_name() -> String {
    let suffix: u16 = rand::rng().random();
    format!("guest-{suffix:04x}")
}

#[cfg(test)]
#[path = "identity_test.rs"]
mod tests;
