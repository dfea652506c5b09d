//! Shared reverse proxy in front of every room.
//!
//! A single nginx container on the shared network routes `/<room>/<port>/` to room
//! containers. Its configuration file is rendered from scratch and replaced whole on
//! every change, then nginx is asked to reload.

mod render;

pub use render::{RouteTable, render_config, upstream_name};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::OrchestratorConfig;
use crate::docker::{
    ContainerRuntimeApi, ContainerState, CreateContainerBody, EmptyObject, HostConfig, PortBinding,
};
use crate::error::{OrchestratorError, Result};
use crate::exec::CommandExecutor;
use crate::ports::ProxyControl;
use crate::rooms::RoomManager;

/// Directory the configuration is mounted at inside the proxy container.
const MOUNT_DIR: &str = "/etc/nginx/cloudroom";
const CONFIG_FILE: &str = "nginx.conf";

/// Renders, writes and reloads the proxy configuration.
#[derive(Clone)]
pub struct ProxyConfigurator {
    runtime: Arc<dyn ContainerRuntimeApi>,
    executor: CommandExecutor,
    rooms: RoomManager,
    config: Arc<OrchestratorConfig>,
    routes: Arc<Mutex<RouteTable>>,
}

impl ProxyConfigurator {
    pub fn new(
        executor: CommandExecutor,
        rooms: RoomManager,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            runtime: executor.runtime().clone(),
            executor,
            rooms,
            config,
            routes: Arc::new(Mutex::new(RouteTable::new())),
        }
    }

    /// Host path of the generated configuration file.
    pub fn config_path(&self) -> PathBuf {
        self.config.proxy.config_dir.join(CONFIG_FILE)
    }

    /// Snapshot of the current route table.
    pub async fn routes(&self) -> RouteTable {
        self.routes.lock().await.clone()
    }

    /// Write the initial configuration and make sure the proxy container runs.
    pub async fn ensure_infrastructure(&self) -> Result<()> {
        {
            let routes = self.routes.lock().await;
            self.write_config(&routes).await?;
        }
        self.ensure_proxy().await
    }

    /// Replace the configuration file with a rendering of `routes`.
    async fn write_config(&self, routes: &RouteTable) -> Result<()> {
        let dir = &self.config.proxy.config_dir;
        tokio::fs::create_dir_all(dir).await?;
        let rendered = render_config(routes, &self.config.container_prefix);
        let final_path = self.config_path();
        let temp_path = dir.join(format!(".{}.tmp", CONFIG_FILE));
        tokio::fs::write(&temp_path, rendered.as_bytes()).await?;
        tokio::fs::rename(&temp_path, &final_path).await?;
        debug!(
            "wrote proxy config {} ({} rooms)",
            final_path.display(),
            routes.len()
        );
        Ok(())
    }

    fn container_body(&self) -> CreateContainerBody {
        let proxy = &self.config.proxy;
        CreateContainerBody {
            image: proxy.image.clone(),
            cmd: Some(vec![
                "nginx".to_string(),
                "-g".to_string(),
                "daemon off;".to_string(),
                "-c".to_string(),
                format!("{}/{}", MOUNT_DIR, CONFIG_FILE),
            ]),
            exposed_ports: HashMap::from([("80/tcp".to_string(), EmptyObject {})]),
            host_config: HostConfig {
                binds: vec![format!("{}:{}:ro", proxy.config_dir.display(), MOUNT_DIR)],
                network_mode: Some(self.config.network_name.clone()),
                port_bindings: HashMap::from([(
                    "80/tcp".to_string(),
                    vec![PortBinding {
                        host_ip: None,
                        host_port: proxy.host_port.to_string(),
                    }],
                )]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Find the proxy container by name, starting it if stopped or creating it if absent.
    pub async fn ensure_proxy(&self) -> Result<()> {
        let name = &self.config.proxy.container_name;
        let containers = self.runtime.list_containers(true).await?;
        if let Some(existing) = containers.iter().find(|c| c.has_name(name)) {
            if existing.state == ContainerState::Running {
                debug!("proxy container {} already running", name);
            } else {
                info!("starting stopped proxy container {}", name);
                self.runtime.start_container(&existing.id).await?;
            }
            return Ok(());
        }

        self.rooms.ensure_image(&self.config.proxy.image).await?;
        let id = self
            .runtime
            .create_container(name, &self.container_body())
            .await?;
        self.runtime.start_container(&id).await?;
        info!(
            "proxy container {} started on host port {}",
            name, self.config.proxy.host_port
        );
        Ok(())
    }

    /// Ask nginx to re-read its configuration, restarting the container when that fails.
    pub async fn reload(&self) -> Result<()> {
        let name = &self.config.proxy.container_name;
        self.ensure_proxy().await?;
        let reload_error = match self.executor.exec(name, "nginx -s reload").await {
            Ok(_) => {
                info!("proxy configuration reloaded");
                return Ok(());
            }
            Err(e) => e,
        };

        warn!("proxy reload failed ({}), restarting {}", reload_error, name);
        self.runtime.restart_container(name).await.map_err(|e| {
            OrchestratorError::ProxyReloadFailed(format!(
                "reload: {}; restart: {}",
                reload_error, e
            ))
        })?;
        info!("proxy container {} restarted", name);
        Ok(())
    }

    /// Store `ports` for a room (an empty set drops it) and regenerate.
    pub async fn update_room(&self, room_id: &str, ports: &BTreeSet<u16>) -> Result<()> {
        let mut routes = self.routes.lock().await;
        if ports.is_empty() {
            routes.remove(room_id);
        } else {
            routes.insert(room_id.to_string(), ports.clone());
        }
        self.write_config(&routes).await?;
        drop(routes);
        self.reload().await
    }
}

#[async_trait]
impl ProxyControl for ProxyConfigurator {
    async fn apply_ports(&self, room_id: &str, ports: &BTreeSet<u16>) {
        if let Err(e) = self.update_room(room_id, ports).await {
            error!("proxy update for room {} failed: {}", room_id, e);
        }
    }

    async fn remove_room(&self, room_id: &str) {
        if let Err(e) = self.update_room(room_id, &BTreeSet::new()).await {
            error!("proxy cleanup for room {} failed: {}", room_id, e);
        }
    }
}
