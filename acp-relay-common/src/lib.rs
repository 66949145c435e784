//! Shared types used by both the relay binary and its tests.
//!
//! Kept deliberately tiny, mirroring the role this crate plays for the
//! wider workspace: small, dependency-light primitives that would otherwise
//! be duplicated between the relay crate and anything that drives it.

/// Thread-safe generic state machine wrapper.
pub mod state_machine;
/// Client-visible session message records and the bounded per-session store.
pub mod message;
/// RFC 3339 (de)serialization helpers for `chrono::DateTime<Utc>` fields.
pub mod time;

pub use message::{Message, MessageKind, MessageStore};
pub use state_machine::StateMachine;
