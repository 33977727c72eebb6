//! Relay services used by the websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! `registry`, `session`, and `voice` own the three in-memory tables.
//! `sync` composes them with the persistence adapter into the operations
//! the wire protocol exposes, so route handlers stay focused on frame
//! validation and reply shaping.

pub mod registry;
pub mod session;
pub mod sync;
pub mod voice;
