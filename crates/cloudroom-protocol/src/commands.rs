//! Commands sent by clients to the core.

use serde::{Deserialize, Serialize};

/// All client -> server commands, tagged by the `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// Create a new room from an image or a language preset.
    #[serde(rename = "createRoom")]
    CreateRoom {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },

    /// Subscribe to a room's events.
    #[serde(rename = "joinRoom")]
    JoinRoom { room_id: String },

    /// Unsubscribe from a room's events.
    #[serde(rename = "leaveRoom")]
    LeaveRoom { room_id: String },

    /// Create (or reattach to) a terminal in a room.
    #[serde(rename = "createTerminal")]
    CreateTerminal { room_id: String, terminal_id: String },

    /// Raw input for a terminal. Passed through without newline translation.
    #[serde(rename = "terminal:write")]
    TerminalWrite {
        room_id: String,
        terminal_id: String,
        data: String,
    },

    /// Resize a terminal.
    #[serde(rename = "terminal:resize")]
    TerminalResize {
        room_id: String,
        terminal_id: String,
        cols: u16,
        rows: u16,
    },

    /// Kill a terminal explicitly.
    #[serde(rename = "terminal:kill")]
    TerminalKill { room_id: String, terminal_id: String },
}

impl ClientCommand {
    /// Room the command targets, if any.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ClientCommand::CreateRoom { room_id, .. } => room_id.as_deref(),
            ClientCommand::JoinRoom { room_id }
            | ClientCommand::LeaveRoom { room_id }
            | ClientCommand::CreateTerminal { room_id, .. }
            | ClientCommand::TerminalWrite { room_id, .. }
            | ClientCommand::TerminalResize { room_id, .. }
            | ClientCommand::TerminalKill { room_id, .. } => Some(room_id),
        }
    }
}
