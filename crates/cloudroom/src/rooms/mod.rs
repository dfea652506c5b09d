//! Room container lifecycle.
//!
//! One container per room, named `<prefix><room id>`. Nothing here caches the room to
//! container mapping: every query lists or inspects containers again, since containers can
//! be removed behind our back.

mod presets;

pub use presets::LanguagePreset;

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::docker::{
    ContainerRuntimeApi, ContainerState, ContainerSummary, CreateContainerBody, EmptyObject,
    HostConfig,
};
use crate::error::{OrchestratorError, Result};
use crate::exec::CommandExecutor;

/// Label carrying the room id on every room container.
pub const ROOM_LABEL: &str = "cloudroom.room";
/// Label carrying the room's primary exposed port.
pub const PORT_LABEL: &str = "cloudroom.port";

/// Parameters of a new room.
#[derive(Debug, Clone)]
pub struct CreateRoomRequest {
    pub image: String,
    /// Generated when `None`.
    pub room_id: Option<String>,
    pub exposed_port: u16,
    pub env_vars: Vec<String>,
}

impl CreateRoomRequest {
    /// Request for a language preset, `None` for unknown languages.
    pub fn from_language(language: &str, room_id: Option<String>) -> Option<Self> {
        LanguagePreset::lookup(language).map(|preset| Self {
            image: preset.image.to_string(),
            room_id,
            exposed_port: preset.port,
            env_vars: preset.env_vars(),
        })
    }
}

/// A room whose container was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: String,
    pub container_id: String,
    pub container_name: String,
    pub created_at: DateTime<Utc>,
}

/// Current runtime view of a room's container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomContainer {
    pub room_id: String,
    pub container_id: String,
    pub container_name: String,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
}

impl RoomContainer {
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    fn from_summary(room_id: &str, name: &str, summary: &ContainerSummary) -> Self {
        Self {
            room_id: room_id.to_string(),
            container_id: summary.id.clone(),
            container_name: name.to_string(),
            state: summary.state,
            created_at: Utc
                .timestamp_opt(summary.created, 0)
                .single()
                .unwrap_or_default(),
        }
    }
}

/// `<unix millis>-<8 hex chars>`.
pub fn generate_room_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

/// Room ids are 1 to 64 characters of `[A-Za-z0-9_-]`.
pub fn validate_room_id(room_id: &str) -> Result<()> {
    let valid = !room_id.is_empty()
        && room_id.len() <= 64
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidInput(format!(
            "invalid room id '{}'",
            room_id
        )))
    }
}

/// Creates, finds and removes room containers.
#[derive(Clone)]
pub struct RoomManager {
    runtime: Arc<dyn ContainerRuntimeApi>,
    executor: CommandExecutor,
    config: Arc<OrchestratorConfig>,
}

impl RoomManager {
    pub fn new(executor: CommandExecutor, config: Arc<OrchestratorConfig>) -> Self {
        Self {
            runtime: executor.runtime().clone(),
            executor,
            config,
        }
    }

    pub fn container_name(&self, room_id: &str) -> String {
        self.config.container_name(room_id)
    }

    /// Create the shared network if it does not exist yet.
    pub async fn ensure_network(&self) -> Result<()> {
        let name = &self.config.network_name;
        let networks = self.runtime.list_networks().await?;
        if networks.iter().any(|n| &n.name == name) {
            debug!("network {} already exists", name);
            return Ok(());
        }
        info!("creating network {}", name);
        self.runtime.create_network(name).await?;
        Ok(())
    }

    /// Pull `image` unless it is present locally.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.runtime.image_exists(image).await? {
            return Ok(());
        }
        info!("image {} not found locally, pulling", image);
        self.runtime.pull_image(image).await?;
        info!("pulled image {}", image);
        Ok(())
    }

    fn container_body(&self, room_id: &str, request: &CreateRoomRequest) -> CreateContainerBody {
        let port_key = format!("{}/tcp", request.exposed_port);
        let base_path = format!("/{}/{}/", room_id, request.exposed_port);
        let storage = self.config.storage_dir.join(room_id);

        let mut env = request.env_vars.clone();
        env.push(format!("BASE_PATH={}", base_path));
        env.push(format!("VITE_BASE_PATH={}", base_path));

        let mut labels = HashMap::new();
        labels.insert(ROOM_LABEL.to_string(), room_id.to_string());
        labels.insert(PORT_LABEL.to_string(), request.exposed_port.to_string());

        CreateContainerBody {
            image: request.image.clone(),
            cmd: None,
            env,
            exposed_ports: HashMap::from([(port_key, EmptyObject {})]),
            working_dir: Some(self.config.workspace_dir.clone()),
            tty: true,
            open_stdin: true,
            labels,
            host_config: HostConfig {
                binds: vec![format!(
                    "{}:{}",
                    storage.display(),
                    self.config.workspace_dir
                )],
                network_mode: Some(self.config.network_name.clone()),
                nano_cpus: Some(self.config.limits.nano_cpus()),
                memory: Some(self.config.limits.memory_bytes()),
                auto_remove: true,
                privileged: false,
                ..Default::default()
            },
        }
    }

    /// Create and start a room container, then install the in-container tools.
    pub async fn create(&self, request: &CreateRoomRequest) -> Result<Room> {
        let room_id = match &request.room_id {
            Some(id) => id.clone(),
            None => generate_room_id(),
        };
        validate_room_id(&room_id)?;
        let name = self.container_name(&room_id);

        if self.lookup(&room_id).await?.is_some() {
            return Err(OrchestratorError::InvalidInput(format!(
                "room '{}' already exists",
                room_id
            )));
        }

        tokio::fs::create_dir_all(self.config.storage_dir.join(&room_id)).await?;
        self.ensure_image(&request.image).await?;

        let body = self.container_body(&room_id, request);
        let container_id = self.runtime.create_container(&name, &body).await?;
        if let Err(e) = self.runtime.start_container(&container_id).await {
            warn!("container {} for room {} did not start: {}", name, room_id, e);
            if let Err(cleanup) = self.runtime.remove_container(&container_id, true).await {
                warn!("could not remove unstarted container {}: {}", name, cleanup);
            }
            return Err(e.into());
        }
        info!(
            "started container {} for room {} using {}",
            name, room_id, request.image
        );

        match self
            .executor
            .run(&container_id, &self.config.tool_install_command)
            .await
        {
            Ok(output) if output.success() => debug!("tools installed in {}", name),
            Ok(output) => warn!(
                "tool install in {} exited {}: {}",
                name,
                output.exit_code,
                output.stderr.trim()
            ),
            Err(e) => warn!("tool install in {} failed: {}", name, e),
        }

        Ok(Room {
            id: room_id,
            container_id,
            container_name: name,
            created_at: Utc::now(),
        })
    }

    /// Find a room's container by name. Re-lists containers on every call.
    pub async fn lookup(&self, room_id: &str) -> Result<Option<RoomContainer>> {
        let name = self.container_name(room_id);
        let containers = self.runtime.list_containers(true).await?;
        Ok(containers
            .iter()
            .find(|c| c.has_name(&name))
            .map(|c| RoomContainer::from_summary(room_id, &name, c)))
    }

    /// Id of the room's running container, or `ContainerUnavailable`.
    pub async fn running_container(&self, room_id: &str) -> Result<RoomContainer> {
        match self.lookup(room_id).await? {
            Some(container) if container.is_running() => Ok(container),
            Some(container) => Err(OrchestratorError::unavailable(
                room_id,
                format!("container is {}", container.state),
            )),
            None => Err(OrchestratorError::unavailable(room_id, "no container")),
        }
    }

    /// Every room container the runtime knows about.
    pub async fn list(&self) -> Result<Vec<RoomContainer>> {
        let containers = self.runtime.list_containers(true).await?;
        let mut rooms: Vec<RoomContainer> = containers
            .iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .iter()
                    .map(|n| n.trim_start_matches('/'))
                    .find(|n| n.starts_with(&self.config.container_prefix))?;
                let room_id = c
                    .labels
                    .get(ROOM_LABEL)
                    .cloned()
                    .unwrap_or_else(|| name[self.config.container_prefix.len()..].to_string());
                Some(RoomContainer::from_summary(&room_id, name, c))
            })
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        Ok(rooms)
    }

    /// Stop and remove a room's container. Returns false if there was none.
    pub async fn remove(&self, room_id: &str) -> Result<bool> {
        let Some(container) = self.lookup(room_id).await? else {
            debug!("no container for room {}", room_id);
            return Ok(false);
        };

        info!("stopping and removing container {}", container.container_name);
        if let Err(e) = self
            .runtime
            .stop_container(&container.container_id, Some(10))
            .await
            && !e.is_not_found()
        {
            return Err(e.into());
        }
        // Auto-remove may already have deleted it after the stop.
        if let Err(e) = self
            .runtime
            .remove_container(&container.container_id, true)
            .await
            && !e.is_not_found()
        {
            return Err(e.into());
        }
        Ok(true)
    }

    /// Address of the room's container on the shared network.
    ///
    /// An empty string means "not assigned yet", not an error.
    pub async fn internal_ip(&self, room_id: &str) -> Result<String> {
        let name = self.container_name(room_id);
        let info = match self.runtime.inspect_container(&name).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                return Err(OrchestratorError::unavailable(room_id, "no container"));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(info
            .network_settings
            .networks
            .get(&self.config.network_name)
            .map(|n| n.ip_address.clone())
            .unwrap_or_default())
    }
}
