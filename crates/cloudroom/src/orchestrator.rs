//! The orchestrator context.
//!
//! Owns one instance of every component and wires them together. It is constructed
//! explicitly and handed to transports; nothing in the crate is a process-wide singleton.

use cloudroom_protocol::{ClientCommand, FileNode, RoomEvent};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::docker::{ContainerRuntimeApi, DockerClient};
use crate::error::{OrchestratorError, Result};
use crate::exec::CommandExecutor;
use crate::files::{FileTreeService, TreeDiff};
use crate::hub::RoomHub;
use crate::ports::{LsofScanner, PortMonitor, PortScanner, ProxyControl};
use crate::proxy::ProxyConfigurator;
use crate::rooms::{CreateRoomRequest, Room, RoomContainer, RoomManager};
use crate::terminal::{CreateOutcome, DockerPtySpawner, PtySpawner, TerminalRegistry};
use crate::watcher::FileWatcher;

/// Every component of the room core, constructed once.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    runtime: Arc<dyn ContainerRuntimeApi>,
    executor: CommandExecutor,
    rooms: RoomManager,
    files: FileTreeService,
    proxy: ProxyConfigurator,
    monitor: PortMonitor,
    terminals: TerminalRegistry,
    watcher: FileWatcher,
    hub: Arc<RoomHub>,
}

impl Orchestrator {
    /// Build the context on top of `runtime` and `spawner`.
    pub fn new(
        config: OrchestratorConfig,
        runtime: Arc<dyn ContainerRuntimeApi>,
        spawner: Arc<dyn PtySpawner>,
    ) -> Self {
        let config = Arc::new(config);
        let hub = Arc::new(RoomHub::new());
        let executor = CommandExecutor::new(runtime.clone());
        let rooms = RoomManager::new(executor.clone(), config.clone());
        let files = FileTreeService::new(executor.clone(), config.clone());
        let proxy = ProxyConfigurator::new(executor.clone(), rooms.clone(), config.clone());
        let scanner: Arc<dyn PortScanner> = Arc::new(LsofScanner::new(executor.clone()));
        let monitor = PortMonitor::new(
            executor.clone(),
            rooms.clone(),
            scanner,
            Arc::new(proxy.clone()),
            hub.clone(),
            config.monitor_interval(),
        );
        let terminals = TerminalRegistry::new(spawner, runtime.clone(), hub.clone());
        let watcher = FileWatcher::new(executor.clone(), files.clone(), hub.clone(), config.clone());

        Self {
            config,
            runtime,
            executor,
            rooms,
            files,
            proxy,
            monitor,
            terminals,
            watcher,
            hub,
        }
    }

    /// Context talking to the Docker Engine at `config.docker_socket`.
    pub fn with_docker(config: OrchestratorConfig) -> Self {
        let runtime = Arc::new(DockerClient::new(config.docker_socket.clone()));
        let spawner = Arc::new(DockerPtySpawner::new(
            config.docker_binary.clone(),
            config.workspace_dir.clone(),
        ));
        Self::new(config, runtime, spawner)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntimeApi> {
        &self.runtime
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn files(&self) -> &FileTreeService {
        &self.files
    }

    pub fn proxy(&self) -> &ProxyConfigurator {
        &self.proxy
    }

    pub fn monitor(&self) -> &PortMonitor {
        &self.monitor
    }

    pub fn terminals(&self) -> &TerminalRegistry {
        &self.terminals
    }

    pub fn watcher(&self) -> &FileWatcher {
        &self.watcher
    }

    /// Create the shared network and the proxy if they are missing. Idempotent.
    pub async fn ensure_infrastructure(&self) -> Result<()> {
        self.rooms.ensure_network().await?;
        self.proxy.ensure_infrastructure().await?;
        info!("infrastructure ready");
        Ok(())
    }

    /// Create a room and start monitoring its ports.
    pub async fn create_room(&self, request: &CreateRoomRequest) -> Result<Room> {
        let room = self.rooms.create(request).await?;
        self.monitor.start(&room.id, &room.container_id);
        Ok(room)
    }

    /// Build a request from an image or a language preset. The image wins when both are given.
    pub fn room_request(
        image: Option<String>,
        language: Option<String>,
        room_id: Option<String>,
    ) -> Result<CreateRoomRequest> {
        let preset = language
            .as_deref()
            .map(|lang| {
                CreateRoomRequest::from_language(lang, room_id.clone()).ok_or_else(|| {
                    OrchestratorError::InvalidInput(format!("unknown language '{}'", lang))
                })
            })
            .transpose()?;
        match (image, preset) {
            (Some(image), Some(preset)) => Ok(CreateRoomRequest { image, ..preset }),
            (Some(image), None) => Ok(CreateRoomRequest {
                image,
                room_id,
                exposed_port: 8080,
                env_vars: Vec::new(),
            }),
            (None, Some(preset)) => Ok(preset),
            (None, None) => Err(OrchestratorError::InvalidInput(
                "createRoom needs an image or a language".to_string(),
            )),
        }
    }

    pub async fn get_container(&self, room_id: &str) -> Result<Option<RoomContainer>> {
        self.rooms.lookup(room_id).await
    }

    /// Tear a room down: background loops, terminals, proxy routes and the container.
    pub async fn remove_room(&self, room_id: &str) -> Result<bool> {
        self.watcher.stop(room_id);
        self.monitor.stop(room_id);
        let killed = self.terminals.kill_room(room_id).await;
        if killed > 0 {
            debug!("killed {} terminal(s) of room {}", killed, room_id);
        }
        self.proxy.remove_room(room_id).await;
        self.files.forget(room_id);
        self.hub.drop_room(room_id);
        let removed = self.rooms.remove(room_id).await?;
        if removed {
            info!("room {} removed", room_id);
        }
        Ok(removed)
    }

    /// Subscribe a client to a room and send it the current state.
    pub async fn join_room(&self, client_id: &str, room_id: &str) -> Result<RoomContainer> {
        let container = self.rooms.running_container(room_id).await?;
        self.hub.join_room(client_id, room_id);
        self.watcher.start(room_id, &container.container_id);
        self.monitor.start(room_id, &container.container_id);

        self.hub
            .send_to_client(
                client_id,
                RoomEvent::RoomJoined {
                    room_id: room_id.to_string(),
                    container_id: container.container_id.clone(),
                },
            )
            .await;
        match self.files.get_file_tree(room_id).await {
            Ok(tree) => {
                self.hub
                    .send_to_client(client_id, RoomEvent::DirectoryChanged { tree })
                    .await
            }
            Err(e) => warn!("initial tree for room {} failed: {}", room_id, e),
        }
        let ports = self.monitor.current_ports(room_id);
        if !ports.is_empty() {
            self.hub
                .send_to_client(
                    client_id,
                    RoomEvent::ActivePorts {
                        container_id: container.container_id.clone(),
                        ports,
                    },
                )
                .await;
        }
        Ok(container)
    }

    /// Unsubscribe a client. The last member leaving stops the room's watcher and monitor.
    pub fn leave_room(&self, client_id: &str, room_id: &str) {
        if self.hub.leave_room(client_id, room_id) == 0 {
            info!("room {} has no members, stopping background loops", room_id);
            self.watcher.stop(room_id);
            self.monitor.stop(room_id);
        }
    }

    /// Leave every room of a client whose last connection closed.
    ///
    /// Terminals and containers are kept for reconnects.
    pub fn disconnect(&self, client_id: &str) {
        for room_id in self.hub.client_rooms(client_id) {
            self.leave_room(client_id, &room_id);
        }
    }

    /// Create a terminal (or reattach) and confirm it to the requesting client.
    pub async fn create_terminal(
        &self,
        client_id: &str,
        room_id: &str,
        terminal_id: &str,
    ) -> Result<CreateOutcome> {
        let container = self.rooms.running_container(room_id).await?;
        let outcome = self
            .terminals
            .create(room_id, terminal_id, &container.container_id)
            .await?;
        self.hub
            .send_to_client(
                client_id,
                RoomEvent::TerminalCreated {
                    room_id: room_id.to_string(),
                    terminal_id: terminal_id.to_string(),
                },
            )
            .await;
        Ok(outcome)
    }

    /// Execute one client command.
    pub async fn handle_command(&self, client_id: &str, command: ClientCommand) -> Result<()> {
        match command {
            ClientCommand::CreateRoom {
                room_id,
                image,
                language,
            } => {
                let request = Self::room_request(image, language, room_id)?;
                let room = self.create_room(&request).await?;
                self.hub
                    .send_to_client(
                        client_id,
                        RoomEvent::RoomCreated {
                            room_id: room.id,
                            container_id: room.container_id,
                        },
                    )
                    .await;
            }
            ClientCommand::JoinRoom { room_id } => {
                self.join_room(client_id, &room_id).await?;
            }
            ClientCommand::LeaveRoom { room_id } => self.leave_room(client_id, &room_id),
            ClientCommand::CreateTerminal {
                room_id,
                terminal_id,
            } => {
                self.create_terminal(client_id, &room_id, &terminal_id)
                    .await?;
            }
            ClientCommand::TerminalWrite {
                room_id,
                terminal_id,
                data,
            } => self
                .terminals
                .write(&room_id, &terminal_id, data.as_bytes())?,
            ClientCommand::TerminalResize {
                room_id,
                terminal_id,
                cols,
                rows,
            } => {
                self.terminals.resize(&room_id, &terminal_id, cols, rows)?;
            }
            ClientCommand::TerminalKill {
                room_id,
                terminal_id,
            } => {
                self.terminals.kill(&room_id, &terminal_id).await;
            }
        }
        Ok(())
    }

    /// Execute a command, answering failures with an `error` event to the client.
    pub async fn dispatch(&self, client_id: &str, command: ClientCommand) {
        let room_id = command.room_id().map(str::to_string);
        if let Err(e) = self.handle_command(client_id, command).await {
            warn!("command from client {} failed: {}", client_id, e);
            self.hub
                .send_to_client(
                    client_id,
                    RoomEvent::Error {
                        message: e.to_string(),
                        room_id,
                    },
                )
                .await;
        }
    }

    /// Start the terminal liveness sweep.
    pub fn spawn_heartbeat(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.terminals
            .spawn_heartbeat(self.config.heartbeat_interval(), cancel)
    }

    pub async fn get_file_tree(&self, room_id: &str) -> Result<Vec<FileNode>> {
        self.files.get_file_tree(room_id).await
    }

    /// Converge a room's workspace onto `desired`.
    pub async fn sync_tree(&self, room_id: &str, desired: &[FileNode]) -> Result<TreeDiff> {
        self.files.sync(room_id, desired).await
    }

    pub async fn read_file(&self, room_id: &str, path: &str) -> Result<String> {
        self.files.read_file(room_id, path).await
    }

    pub async fn write_file(&self, room_id: &str, path: &str, content: &str) -> Result<()> {
        self.files.write_file(room_id, path, content).await
    }

    pub async fn create_file(&self, room_id: &str, path: &str) -> Result<()> {
        self.files.create_file(room_id, path).await
    }

    pub async fn create_folder(&self, room_id: &str, path: &str) -> Result<()> {
        self.files.create_folder(room_id, path).await
    }

    pub async fn delete_path(&self, room_id: &str, path: &str) -> Result<()> {
        self.files.delete_path(room_id, path).await
    }

    pub async fn rename_path(&self, room_id: &str, from: &str, to: &str) -> Result<()> {
        self.files.rename_path(room_id, from, to).await
    }
}
