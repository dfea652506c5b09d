//! Terminal sessions keyed by (room, terminal id).
//!
//! A session moves `absent -> starting -> attached -> exited`. Exactly one party removes
//! a session from the registry (process exit, explicit kill or the heartbeat sweep) and
//! that party publishes the single `terminal:exit` event.

mod pty;

pub use pty::{DockerPtySpawner, PtyHandle, PtySpawner, SpawnedPty, TerminalSize};

use cloudroom_protocol::RoomEvent;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::docker::ContainerRuntimeApi;
use crate::error::{OrchestratorError, Result};
use crate::hub::RoomHub;

/// Result of [`TerminalRegistry::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new PTY process was spawned.
    Created,
    /// A session already existed for the key; nothing was spawned.
    Reattached,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    room_id: String,
    terminal_id: String,
}

impl SessionKey {
    fn new(room_id: &str, terminal_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            terminal_id: terminal_id.to_string(),
        }
    }
}

struct Session {
    container_id: String,
    handle: Arc<dyn PtyHandle>,
}

enum Slot {
    Starting { generation: u64 },
    Attached { generation: u64, session: Session },
}

impl Slot {
    fn generation(&self) -> u64 {
        match self {
            Slot::Starting { generation } | Slot::Attached { generation, .. } => *generation,
        }
    }
}

/// Decodes UTF-8 across chunk boundaries, carrying incomplete trailing sequences.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }
}

struct Inner {
    spawner: Arc<dyn PtySpawner>,
    runtime: Arc<dyn ContainerRuntimeApi>,
    hub: Arc<RoomHub>,
    sessions: Mutex<HashMap<SessionKey, Slot>>,
    next_generation: AtomicU64,
}

/// Registry of live terminal sessions.
#[derive(Clone)]
pub struct TerminalRegistry {
    inner: Arc<Inner>,
}

impl TerminalRegistry {
    pub fn new(
        spawner: Arc<dyn PtySpawner>,
        runtime: Arc<dyn ContainerRuntimeApi>,
        hub: Arc<RoomHub>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                spawner,
                runtime,
                hub,
                sessions: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    fn sessions(&self) -> Result<std::sync::MutexGuard<'_, HashMap<SessionKey, Slot>>> {
        self.inner
            .sessions
            .lock()
            .map_err(|_| OrchestratorError::Terminal("terminal registry poisoned".to_string()))
    }

    /// Create a terminal in `container_id`, or report a reattach if one exists for the key.
    pub async fn create(
        &self,
        room_id: &str,
        terminal_id: &str,
        container_id: &str,
    ) -> Result<CreateOutcome> {
        let key = SessionKey::new(room_id, terminal_id);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.sessions()?;
            if sessions.contains_key(&key) {
                debug!("terminal {} in room {} already exists", terminal_id, room_id);
                return Ok(CreateOutcome::Reattached);
            }
            sessions.insert(key.clone(), Slot::Starting { generation });
        }

        let spawned = match self
            .inner
            .spawner
            .spawn(container_id, TerminalSize::default())
            .await
        {
            Ok(spawned) => spawned,
            Err(e) => {
                let mut sessions = self.sessions()?;
                if sessions.get(&key).map(Slot::generation) == Some(generation) {
                    sessions.remove(&key);
                }
                return Err(e);
            }
        };

        let SpawnedPty {
            handle,
            output,
            exit,
        } = spawned;
        {
            let mut sessions = self.sessions()?;
            let still_starting = matches!(
                sessions.get(&key),
                Some(Slot::Starting { generation: g }) if *g == generation
            );
            if !still_starting {
                drop(sessions);
                handle.kill();
                return Err(OrchestratorError::Terminal(format!(
                    "terminal {} was closed while starting",
                    terminal_id
                )));
            }
            sessions.insert(
                key.clone(),
                Slot::Attached {
                    generation,
                    session: Session {
                        container_id: container_id.to_string(),
                        handle: handle.clone(),
                    },
                },
            );
        }

        info!(
            "terminal {} attached to room {} (container {})",
            terminal_id, room_id, container_id
        );
        let registry = self.clone();
        tokio::spawn(async move {
            registry.pump(key, generation, output, exit).await;
        });
        Ok(CreateOutcome::Created)
    }

    /// Forward output until the process ends, then retire the session.
    async fn pump(
        &self,
        key: SessionKey,
        generation: u64,
        mut output: tokio::sync::mpsc::Receiver<Vec<u8>>,
        exit: tokio::sync::oneshot::Receiver<i32>,
    ) {
        let mut decoder = Utf8Carry::default();
        while let Some(chunk) = output.recv().await {
            let data = decoder.decode(&chunk);
            if data.is_empty() {
                continue;
            }
            self.inner
                .hub
                .publish(
                    &key.room_id,
                    RoomEvent::TerminalOutput {
                        terminal_id: key.terminal_id.clone(),
                        data,
                    },
                )
                .await;
        }
        let code = exit.await.unwrap_or(-1);
        debug!(
            "terminal {} in room {} exited with {}",
            key.terminal_id, key.room_id, code
        );
        if self.retire(&key, Some(generation)).is_some() {
            self.publish_exit(&key).await;
        }
    }

    /// Remove a session, optionally only if it still belongs to `generation`.
    fn retire(&self, key: &SessionKey, generation: Option<u64>) -> Option<Slot> {
        let mut sessions = self.sessions().ok()?;
        let current = sessions.get(key).map(Slot::generation)?;
        if generation.is_some_and(|g| g != current) {
            return None;
        }
        sessions.remove(key)
    }

    async fn publish_exit(&self, key: &SessionKey) {
        info!("terminal {} in room {} exited", key.terminal_id, key.room_id);
        self.inner
            .hub
            .publish(
                &key.room_id,
                RoomEvent::TerminalExit {
                    terminal_id: key.terminal_id.clone(),
                },
            )
            .await;
    }

    fn handle(&self, room_id: &str, terminal_id: &str) -> Result<Arc<dyn PtyHandle>> {
        let sessions = self.sessions()?;
        match sessions.get(&SessionKey::new(room_id, terminal_id)) {
            Some(Slot::Attached { session, .. }) => Ok(session.handle.clone()),
            Some(Slot::Starting { .. }) => Err(OrchestratorError::Terminal(format!(
                "terminal {} is still starting",
                terminal_id
            ))),
            None => Err(OrchestratorError::Terminal(format!(
                "no terminal {} in room {}",
                terminal_id, room_id
            ))),
        }
    }

    /// Forward input verbatim.
    pub fn write(&self, room_id: &str, terminal_id: &str, data: &[u8]) -> Result<()> {
        self.handle(room_id, terminal_id)?.write(data)
    }

    /// Resize a terminal. Returns false when the size was already current.
    pub fn resize(
        &self,
        room_id: &str,
        terminal_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<bool> {
        let size = TerminalSize::new(cols, rows);
        size.validate()?;
        let handle = self.handle(room_id, terminal_id)?;
        if handle.size() == size {
            return Ok(false);
        }
        handle.resize(size)?;
        Ok(true)
    }

    /// Kill a terminal. Returns false if there was none.
    pub async fn kill(&self, room_id: &str, terminal_id: &str) -> bool {
        let key = SessionKey::new(room_id, terminal_id);
        let Some(slot) = self.retire(&key, None) else {
            return false;
        };
        if let Slot::Attached { session, .. } = slot {
            session.handle.kill();
        }
        self.publish_exit(&key).await;
        true
    }

    /// Kill every terminal of a room.
    pub async fn kill_room(&self, room_id: &str) -> usize {
        let ids = self.terminal_ids(room_id);
        let mut killed = 0;
        for terminal_id in ids {
            if self.kill(room_id, &terminal_id).await {
                killed += 1;
            }
        }
        killed
    }

    pub fn terminal_ids(&self, room_id: &str) -> Vec<String> {
        let Ok(sessions) = self.sessions() else {
            return Vec::new();
        };
        let mut ids: Vec<String> = sessions
            .keys()
            .filter(|k| k.room_id == room_id)
            .map(|k| k.terminal_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, room_id: &str, terminal_id: &str) -> bool {
        self.sessions()
            .map(|s| s.contains_key(&SessionKey::new(room_id, terminal_id)))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.sessions().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reclaim every attached session whose container no longer exists.
    ///
    /// Returns the number of reclaimed sessions.
    pub async fn sweep(&self) -> usize {
        let attached: Vec<(SessionKey, u64, String)> = match self.sessions() {
            Ok(sessions) => sessions
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Attached {
                        generation,
                        session,
                    } => Some((key.clone(), *generation, session.container_id.clone())),
                    Slot::Starting { .. } => None,
                })
                .collect(),
            Err(e) => {
                warn!("heartbeat skipped: {}", e);
                return 0;
            }
        };

        let mut reclaimed = 0;
        for (key, generation, container_id) in attached {
            match self.inner.runtime.inspect_container(&container_id).await {
                Ok(_) => continue,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(
                        "heartbeat could not check container {} of room {}: {}",
                        container_id, key.room_id, e
                    );
                    continue;
                }
            }
            if let Some(Slot::Attached { session, .. }) = self.retire(&key, Some(generation)) {
                warn!(
                    "container {} of room {} is gone, reclaiming terminal {}",
                    container_id, key.room_id, key.terminal_id
                );
                session.handle.kill();
                self.publish_exit(&key).await;
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_heartbeat(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            info!("terminal heartbeat every {:?}", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("terminal heartbeat stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let reclaimed = registry.sweep().await;
                        if reclaimed > 0 {
                            info!("heartbeat reclaimed {} terminal(s)", reclaimed);
                        }
                    }
                }
            }
        })
    }
}
