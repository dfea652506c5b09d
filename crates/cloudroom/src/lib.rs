//! Ephemeral per-room development sandboxes.
//!
//! Every room is one container on a shared network with a workspace directory, a set of
//! interactive terminals, a watched file tree and the ports its dev servers listen on,
//! routed through one shared reverse proxy. [`Orchestrator`] wires the pieces together.

pub mod config;
pub mod docker;
pub mod error;
pub mod exec;
pub mod files;
pub mod hub;
pub mod orchestrator;
pub mod ports;
pub mod proxy;
pub mod rooms;
pub mod shell;
pub mod terminal;
pub mod watcher;

#[cfg(test)]
mod test_support;

pub use config::OrchestratorConfig;
pub use docker::{ContainerRuntimeApi, DockerClient, DockerError};
pub use error::{OrchestratorError, Result};
pub use hub::RoomHub;
pub use orchestrator::Orchestrator;
pub use rooms::{CreateRoomRequest, Room, RoomContainer};
pub use terminal::{CreateOutcome, PtySpawner, TerminalSize};
