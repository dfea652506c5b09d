//! Per-room port monitoring loop.
//!
//! One task per room polls the scanner on a fixed interval. The task is bound to the
//! container's own exit notification (`wait`), so it ends by itself when the container
//! goes away; it can also be cancelled when a room loses its last observer.

use async_trait::async_trait;
use cloudroom_protocol::RoomEvent;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{PortScanner, diff_ports};
use crate::error::{OrchestratorError, Result};
use crate::exec::CommandExecutor;
use crate::hub::RoomHub;
use crate::rooms::RoomManager;
use crate::shell::shell_quote;

/// Receives the active port set of a room whenever it changes.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Record `ports` for `room_id` and regenerate the proxy configuration.
    ///
    /// Failures are handled and logged by the implementation.
    async fn apply_ports(&self, room_id: &str, ports: &BTreeSet<u16>);

    /// Drop a room from the proxy configuration.
    async fn remove_room(&self, room_id: &str);
}

struct MonitorTask {
    generation: u64,
    cancel: CancellationToken,
}

struct Inner {
    executor: CommandExecutor,
    rooms: RoomManager,
    scanner: Arc<dyn PortScanner>,
    proxy: Arc<dyn ProxyControl>,
    hub: Arc<RoomHub>,
    interval: Duration,
    tasks: DashMap<String, MonitorTask>,
    ports: DashMap<String, BTreeSet<u16>>,
    generation: AtomicU64,
}

/// Mutable state of one room's loop.
#[derive(Default)]
struct RoomPorts {
    active: BTreeSet<u16>,
    /// Port -> pid of the socat forwarder started for it.
    forwarders: HashMap<u16, u32>,
}

/// Starts and stops port-monitoring loops, one per room.
#[derive(Clone)]
pub struct PortMonitor {
    inner: Arc<Inner>,
}

impl PortMonitor {
    pub fn new(
        executor: CommandExecutor,
        rooms: RoomManager,
        scanner: Arc<dyn PortScanner>,
        proxy: Arc<dyn ProxyControl>,
        hub: Arc<RoomHub>,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                rooms,
                scanner,
                proxy,
                hub,
                interval,
                tasks: DashMap::new(),
                ports: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start monitoring a room. Returns false if a loop is already running for it.
    pub fn start(&self, room_id: &str, container_id: &str) -> bool {
        let cancel = CancellationToken::new();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        match self.inner.tasks.entry(room_id.to_string()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(MonitorTask {
                    generation,
                    cancel: cancel.clone(),
                });
            }
        }

        info!(
            "starting port monitor for room {} (container {})",
            room_id, container_id
        );
        let inner = self.inner.clone();
        let room_id = room_id.to_string();
        let container_id = container_id.to_string();
        tokio::spawn(async move {
            inner.run(&room_id, &container_id, cancel).await;
            inner
                .tasks
                .remove_if(&room_id, |_, task| task.generation == generation);
        });
        true
    }

    /// Cancel a room's loop. Returns false if none was running.
    pub fn stop(&self, room_id: &str) -> bool {
        match self.inner.tasks.remove(room_id) {
            Some((_, task)) => {
                info!("stopping port monitor for room {}", room_id);
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, room_id: &str) -> bool {
        self.inner.tasks.contains_key(room_id)
    }

    /// Ports seen by the last tick of a room, ascending.
    pub fn current_ports(&self, room_id: &str) -> Vec<u16> {
        self.inner
            .ports
            .get(room_id)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Inner {
    async fn run(&self, room_id: &str, container_id: &str, cancel: CancellationToken) {
        let mut state = RoomPorts::default();
        let exited = self.executor.runtime().wait_container(container_id);
        tokio::pin!(exited);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = &mut exited => {
                    match result {
                        Ok(code) => info!("room {} container exited ({}), port monitor done", room_id, code),
                        Err(e) => info!("room {} container gone ({}), port monitor done", room_id, e),
                    }
                    self.ports.remove(room_id);
                    self.proxy.remove_room(room_id).await;
                    return;
                }
                _ = cancel.cancelled() => {
                    info!("port monitor for room {} cancelled", room_id);
                    self.stop_forwarders(room_id, container_id, &mut state).await;
                    self.ports.remove(room_id);
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(room_id, container_id, &mut state).await {
                        warn!("{}", e);
                    }
                }
            }
        }
    }

    async fn tick(&self, room_id: &str, container_id: &str, state: &mut RoomPorts) -> Result<()> {
        let found = self
            .scanner
            .scan(room_id, container_id)
            .await
            .map_err(|e| match e {
                e @ OrchestratorError::PortDiscoveryFailed { .. } => e,
                other => OrchestratorError::PortDiscoveryFailed {
                    room: room_id.to_string(),
                    reason: other.to_string(),
                },
            })?;
        let current: BTreeSet<u16> = found.iter().map(|p| p.port).collect();
        let change = diff_ports(&state.active, &current);
        if !change.is_empty() {
            info!(
                "room {} ports changed: +{:?} -{:?}",
                room_id, change.appeared, change.disappeared
            );
            for port in &change.disappeared {
                if let Some(pid) = state.forwarders.remove(port) {
                    self.kill_forwarder(container_id, *port, pid).await;
                }
            }
            state.active = current;
            self.ports.insert(room_id.to_string(), state.active.clone());
        }

        // Ports seen before the container had an address are retried here.
        self.start_missing_forwarders(room_id, container_id, state)
            .await;
        if change.is_empty() {
            return Ok(());
        }

        for port in &state.active {
            self.probe_health(room_id, container_id, *port).await;
        }

        self.hub
            .publish(
                room_id,
                RoomEvent::ActivePorts {
                    container_id: container_id.to_string(),
                    ports: state.active.iter().copied().collect(),
                },
            )
            .await;
        self.proxy.apply_ports(room_id, &state.active).await;
        Ok(())
    }

    /// Start a forwarder for every active port that has none yet.
    async fn start_missing_forwarders(
        &self,
        room_id: &str,
        container_id: &str,
        state: &mut RoomPorts,
    ) {
        let missing: Vec<u16> = state
            .active
            .iter()
            .filter(|port| !state.forwarders.contains_key(*port))
            .copied()
            .collect();
        if missing.is_empty() {
            return;
        }

        let ip = match self.rooms.internal_ip(room_id).await {
            Ok(ip) => ip,
            Err(e) => {
                debug!("no internal ip for room {}: {}", room_id, e);
                String::new()
            }
        };
        if ip.is_empty() {
            debug!(
                "room {} has no address yet, forwarders for {:?} postponed",
                room_id, missing
            );
            return;
        }
        for port in missing {
            match self.start_forwarder(container_id, &ip, port).await {
                Ok(pid) => {
                    state.forwarders.insert(port, pid);
                }
                Err(e) => warn!("forwarder for room {} port {} failed: {}", room_id, port, e),
            }
        }
    }

    /// Relay `<ip>:<port>` to the container-local `127.0.0.1:<port>`.
    async fn start_forwarder(&self, container_id: &str, ip: &str, port: u16) -> Result<u32> {
        let command = format!(
            "nohup socat TCP-LISTEN:{port},bind={ip},fork,reuseaddr TCP:127.0.0.1:{port} \
             >/dev/null 2>&1 & echo $!",
            port = port,
            ip = shell_quote(ip),
        );
        let pid = self.executor.exec(container_id, &command).await?;
        pid.parse::<u32>()
            .map_err(|_| OrchestratorError::InvalidInput(format!("unexpected pid output '{}'", pid)))
    }

    async fn kill_forwarder(&self, container_id: &str, port: u16, pid: u32) {
        let command = format!("kill {} 2>/dev/null || true", pid);
        match self.executor.exec(container_id, &command).await {
            Ok(_) => debug!("stopped forwarder {} for port {}", pid, port),
            Err(e) => warn!("failed to stop forwarder {} for port {}: {}", pid, port, e),
        }
    }

    async fn stop_forwarders(&self, room_id: &str, container_id: &str, state: &mut RoomPorts) {
        for (port, pid) in std::mem::take(&mut state.forwarders) {
            debug!("room {}: stopping forwarder for port {}", room_id, port);
            self.kill_forwarder(container_id, port, pid).await;
        }
    }

    async fn probe_health(&self, room_id: &str, container_id: &str, port: u16) {
        let command = format!(
            "curl -s -o /dev/null -w '%{{http_code}}' http://localhost:{}/health",
            port
        );
        match self.executor.run(container_id, &command).await {
            Ok(output) if output.stdout.trim() == "200" => {
                debug!("room {} port {} healthy", room_id, port)
            }
            Ok(output) => debug!(
                "room {} port {} health probe answered '{}'",
                room_id,
                port,
                output.stdout.trim()
            ),
            Err(e) => debug!("room {} port {} health probe failed: {}", room_id, port, e),
        }
    }
}
