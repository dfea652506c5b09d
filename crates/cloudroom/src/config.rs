//! Orchestrator configuration.
//!
//! Loaded by the binary from the layered config file / environment; every field has a
//! default so a partial file is enough.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by every orchestrator component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Path of the Docker Engine Unix socket.
    pub docker_socket: PathBuf,
    /// CLI binary used for interactive `exec -it` terminals.
    pub docker_binary: String,
    /// Shared bridge network every room container joins.
    pub network_name: String,
    /// Workspace directory inside every room container.
    pub workspace_dir: String,
    /// Host directory whose `<room>` subdirectories are mounted at `workspace_dir`.
    pub storage_dir: PathBuf,
    /// Prefix of room container names (`<prefix><room id>`).
    pub container_prefix: String,
    pub limits: ResourceLimits,
    pub tree: TreeConfig,
    pub proxy: ProxyConfig,
    /// Seconds between two port enumerations of one room.
    pub monitor_interval_secs: u64,
    /// Seconds between two terminal liveness sweeps.
    pub heartbeat_interval_secs: u64,
    /// Coalescing window of file-change events.
    pub watch_debounce_ms: u64,
    /// Shell command run once in every new room to install lsof, socat, inotifywait and curl.
    pub tool_install_command: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            docker_binary: "docker".to_string(),
            network_name: "cloudroom_network".to_string(),
            workspace_dir: "/workspace".to_string(),
            storage_dir: default_data_subdir("rooms"),
            container_prefix: "room-".to_string(),
            limits: ResourceLimits::default(),
            tree: TreeConfig::default(),
            proxy: ProxyConfig::default(),
            monitor_interval_secs: 5,
            heartbeat_interval_secs: 30,
            watch_debounce_ms: 1000,
            tool_install_command: default_tool_install_command(),
        }
    }
}

impl OrchestratorConfig {
    /// Container name for a room.
    pub fn container_name(&self, room_id: &str) -> String {
        format!("{}{}", self.container_prefix, room_id)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }
}

/// Per-container resource caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU cores (fractional allowed).
    pub cpus: f64,
    /// Memory cap in megabytes.
    pub memory_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: 1.0,
            memory_mb: 1024,
        }
    }
}

impl ResourceLimits {
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb as i64).saturating_mul(1024 * 1024)
    }
}

/// File tree snapshot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Directory names pruned from listings and ignored by the watcher.
    pub blacklist: Vec<String>,
    /// File extensions reclassified as `executable`.
    pub executable_extensions: Vec<String>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            blacklist: [
                "node_modules",
                ".git",
                "dist",
                "build",
                ".next",
                "__pycache__",
                ".venv",
                "target",
                ".cache",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            executable_extensions: [
                "sh", "bash", "zsh", "fish", "ksh", "csh", "command", "run", "bin", "exe", "bat",
                "cmd", "ps1",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Shared reverse proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub container_name: String,
    pub image: String,
    /// Host port the proxy is published on.
    pub host_port: u16,
    /// Host directory holding the generated configuration, mounted into the proxy.
    pub config_dir: PathBuf,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            container_name: "cloudroom_proxy".to_string(),
            image: "nginx:latest".to_string(),
            host_port: 8080,
            config_dir: default_data_subdir("proxy"),
        }
    }
}

fn default_data_subdir(name: &str) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cloudroom")
        .join(name)
}

fn default_tool_install_command() -> String {
    "command -v lsof >/dev/null 2>&1 && command -v socat >/dev/null 2>&1 \
     && command -v inotifywait >/dev/null 2>&1 && command -v curl >/dev/null 2>&1 \
     || (apt-get update -qq && apt-get install -y -qq lsof socat inotify-tools curl) \
     || apk add --no-cache lsof socat inotify-tools curl"
        .to_string()
}
