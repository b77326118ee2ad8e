//! Chat sessions: stored history per session id, expiry, and per-session
//! serialization of updates.

mod locks;
mod manager;
mod record;

pub use locks::SessionLocks;
pub use manager::{session_key, SessionManager, SESSION_KEY_PREFIX};
pub use record::{seed_acknowledgment, RecordError, Role, SessionRecord, Turn};
