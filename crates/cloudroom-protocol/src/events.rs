//! Events published by the core to the clients of a room.
//!
//! Events are ephemeral. A client that joins late re-derives state from the next
//! `directory:changed` / `active-ports` publication rather than from history.

use serde::{Deserialize, Serialize};

use crate::tree::FileNode;

/// All server -> client events, tagged by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum RoomEvent {
    /// Keepalive sent by the transport.
    #[serde(rename = "ping")]
    Ping,

    /// A failed command or an unusable room.
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    /// A room's container is running.
    #[serde(rename = "roomCreated")]
    RoomCreated { room_id: String, container_id: String },

    /// The client is subscribed to a room.
    #[serde(rename = "roomJoined")]
    RoomJoined { room_id: String, container_id: String },

    /// A terminal exists for (room, terminal). Sent on creation and on reattach.
    #[serde(rename = "terminalCreated")]
    TerminalCreated { room_id: String, terminal_id: String },

    /// Raw output of a terminal.
    #[serde(rename = "terminal:output")]
    TerminalOutput { terminal_id: String, data: String },

    /// The terminal's process is gone.
    #[serde(rename = "terminal:exit")]
    TerminalExit { terminal_id: String },

    /// Listening ports changed inside the room container.
    #[serde(rename = "active-ports")]
    ActivePorts { container_id: String, ports: Vec<u16> },

    /// A fresh snapshot of the workspace tree.
    #[serde(rename = "directory:changed")]
    DirectoryChanged { tree: Vec<FileNode> },
}

impl RoomEvent {
    /// Error event scoped to a room.
    pub fn room_error(room_id: impl Into<String>, message: impl Into<String>) -> Self {
        RoomEvent::Error {
            message: message.into(),
            room_id: Some(room_id.into()),
        }
    }

    /// Tag value of this event, as sent on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            RoomEvent::Ping => "ping",
            RoomEvent::Error { .. } => "error",
            RoomEvent::RoomCreated { .. } => "roomCreated",
            RoomEvent::RoomJoined { .. } => "roomJoined",
            RoomEvent::TerminalCreated { .. } => "terminalCreated",
            RoomEvent::TerminalOutput { .. } => "terminal:output",
            RoomEvent::TerminalExit { .. } => "terminal:exit",
            RoomEvent::ActivePorts { .. } => "active-ports",
            RoomEvent::DirectoryChanged { .. } => "directory:changed",
        }
    }
}
