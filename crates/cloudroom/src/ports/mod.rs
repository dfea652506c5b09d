//! Listening-port discovery inside room containers.

mod monitor;

pub use monitor::{PortMonitor, ProxyControl};

use async_trait::async_trait;
use cloudroom_protocol::ActivePort;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::error::{OrchestratorError, Result};
use crate::exec::CommandExecutor;

/// Helper processes whose sockets must not count as application ports.
const IGNORED_COMMANDS: &[&str] = &["socat"];

/// Port at the end of an lsof NAME column: `*:3000`, `127.0.0.1:3000`, `[::1]:5173`.
static PORT_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\d+)$").expect("Invalid regex pattern for port suffix"));

/// Enumerates listening sockets of a container.
///
/// Polling `lsof` is the only implementation; the trait is the seam for an event-driven
/// replacement.
#[async_trait]
pub trait PortScanner: Send + Sync {
    async fn scan(&self, room_id: &str, container: &str) -> Result<Vec<ActivePort>>;
}

/// Scanner running `lsof` through the command executor.
#[derive(Clone)]
pub struct LsofScanner {
    executor: CommandExecutor,
}

impl LsofScanner {
    pub const COMMAND: &'static str =
        "command -v lsof >/dev/null 2>&1 || exit 127; lsof -i -P -n | grep LISTEN || true";

    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl PortScanner for LsofScanner {
    async fn scan(&self, room_id: &str, container: &str) -> Result<Vec<ActivePort>> {
        let output = self
            .executor
            .run(container, Self::COMMAND)
            .await
            .map_err(|e| OrchestratorError::PortDiscoveryFailed {
                room: room_id.to_string(),
                reason: e.to_string(),
            })?;
        if !output.success() {
            return Err(OrchestratorError::PortDiscoveryFailed {
                room: room_id.to_string(),
                reason: format!("lsof exited {}", output.exit_code),
            });
        }
        Ok(parse_lsof(&output.stdout))
    }
}

/// Parse `lsof -i -P -n` LISTEN lines into one entry per port.
///
/// Column 9 holds `addr:port`. Sockets of forwarding helpers are skipped.
pub fn parse_lsof(output: &str) -> Vec<ActivePort> {
    let mut seen = BTreeSet::new();
    let mut ports = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 9 || parts[0] == "COMMAND" {
            continue;
        }
        let command = parts[0];
        if IGNORED_COMMANDS.contains(&command) {
            continue;
        }
        let Some(port) = PORT_SUFFIX
            .captures(parts[8])
            .and_then(|c| c[1].parse::<u16>().ok())
        else {
            continue;
        };
        if !seen.insert(port) {
            continue;
        }
        ports.push(ActivePort {
            port,
            pid: parts[1].parse().unwrap_or(0),
            command: command.to_string(),
        });
    }
    ports.sort_by_key(|p| p.port);
    ports
}

/// Ports that appeared and disappeared between two ticks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortChange {
    pub appeared: Vec<u16>,
    pub disappeared: Vec<u16>,
}

impl PortChange {
    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.disappeared.is_empty()
    }
}

pub fn diff_ports(previous: &BTreeSet<u16>, current: &BTreeSet<u16>) -> PortChange {
    PortChange {
        appeared: current.difference(previous).copied().collect(),
        disappeared: previous.difference(current).copied().collect(),
    }
}
