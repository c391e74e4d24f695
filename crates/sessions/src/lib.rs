//! Session identity and durable metadata.
//!
//! Each session has one row in the SQLite `session_metadata` table holding
//! the fields that must survive a restart: requested and resolved phone
//! identity, display name, webhook URL and ordering position. Connection
//! state is never persisted.

pub mod key;
pub mod metadata;

pub use {
    key::{InvalidSessionId, SessionId},
    metadata::{SessionRecord, SqliteSessionMetadata},
};
