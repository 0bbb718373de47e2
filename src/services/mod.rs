//! Domain services behind the websocket route.
//!
//! ARCHITECTURE
//! ============
//! Service modules own presence, room state, and relay logic so the route
//! handler stays focused on transport and protocol translation. The
//! presence registry and room session table are the two sources of truth;
//! every relay operation consults them, never bypasses them.

pub mod directory;
pub mod identity;
pub mod lifecycle;
pub mod presence;
pub mod relay;
pub mod room;
pub mod signaling;
