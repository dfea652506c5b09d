//! Listening-socket types reported by port discovery.

use serde::{Deserialize, Serialize};

/// A TCP port some process inside a room container is listening on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePort {
    pub port: u16,
    pub pid: u32,
    pub command: String,
}
