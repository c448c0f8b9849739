//! Domain services behind the websocket gateway.
//!
//! ARCHITECTURE
//! ============
//! Service modules own business logic and storage concerns so the route
//! layer can stay focused on protocol translation and identity plumbing.

pub mod chat;
pub mod directory;
pub mod identity;
pub mod plan;
pub mod presence;
pub mod room;
pub mod signaling;
pub mod whiteboard;
