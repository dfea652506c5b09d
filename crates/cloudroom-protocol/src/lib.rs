//! Wire types for cloudroom real-time communication.
//!
//! This crate defines the formats exchanged between the orchestration core and the
//! clients of a room:
//!
//! ```text
//! Client <--[pub/sub: RoomEvent / ClientCommand]--> Core <--[Engine API]--> Container
//! ```
//!
//! Event names follow the names clients already subscribe to (`terminal:output`,
//! `directory:changed`, ...), so the serialized `type` tag is not snake_case everywhere.

pub mod commands;
pub mod events;
pub mod ports;
pub mod tree;

pub use commands::ClientCommand;
pub use events::RoomEvent;
pub use ports::ActivePort;
pub use tree::{FileNode, FileType};
