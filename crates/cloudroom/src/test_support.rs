//! Scripted in-memory engine and PTY fakes for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};

use crate::docker::types::{EndpointSettings, InspectState, NetworkSettings};
use crate::docker::{
    ContainerInspect, ContainerRuntimeApi, ContainerState, ContainerSummary, CreateContainerBody,
    DockerError, DockerResult, ExecInspect, ExecOutputStream, NetworkSummary,
};
use crate::error::Result;
use crate::exec::demux::{StreamKind, encode_frame};
use crate::terminal::{PtyHandle, PtySpawner, SpawnedPty, TerminalSize};

struct FakeContainer {
    id: String,
    name: String,
    running: bool,
    ip: String,
    labels: HashMap<String, String>,
    stopped: watch::Sender<bool>,
}

#[derive(Clone)]
enum Reply {
    Output {
        stdout: String,
        stderr: String,
        exit_code: i64,
    },
    Broken,
}

struct ExecRecord {
    container: String,
    command: String,
    exit_code: i64,
}

#[derive(Default)]
struct State {
    containers: Vec<FakeContainer>,
    replies: Vec<(String, Reply)>,
    live_streams: HashMap<String, mpsc::UnboundedReceiver<Vec<u8>>>,
    execs: HashMap<String, ExecRecord>,
    /// Execs started on a live stream; the engine reports them as still running.
    live_execs: HashSet<String>,
    commands: Vec<(String, String)>,
    networks: Vec<String>,
    images: HashSet<String>,
    pulled: Vec<String>,
    created: Vec<(String, CreateContainerBody)>,
    restarts: Vec<String>,
    next_id: u64,
}

impl State {
    fn find(&self, id_or_name: &str) -> Option<&FakeContainer> {
        self.containers
            .iter()
            .find(|c| c.id == id_or_name || c.name == id_or_name)
    }

    fn find_mut(&mut self, id_or_name: &str) -> Option<&mut FakeContainer> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id_or_name || c.name == id_or_name)
    }

    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:08x}", prefix, self.next_id)
    }
}

/// Engine whose exec output is scripted by command substring.
#[derive(Default)]
pub struct ScriptedRuntime {
    state: Mutex<State>,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Register a container and return its id.
    pub fn add_container(&self, name: &str, running: bool) -> String {
        let mut state = self.lock();
        let id = state.next("c");
        let (stopped, _) = watch::channel(!running);
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            running,
            ip: String::new(),
            labels: HashMap::new(),
            stopped,
        });
        id
    }

    pub fn set_ip(&self, name: &str, ip: &str) {
        if let Some(c) = self.lock().find_mut(name) {
            c.ip = ip.to_string();
        }
    }

    /// Simulate the container exiting.
    pub fn stop(&self, name: &str) {
        if let Some(c) = self.lock().find_mut(name) {
            c.running = false;
            let _ = c.stopped.send(true);
        }
    }

    /// Simulate an out-of-band `docker rm -f`.
    pub fn vanish(&self, name: &str) {
        let mut state = self.lock();
        if let Some(pos) = state
            .containers
            .iter()
            .position(|c| c.id == name || c.name == name)
        {
            let c = state.containers.remove(pos);
            let _ = c.stopped.send(true);
        }
    }

    /// Replies to every command containing `pattern`. Replaces an earlier reply for it.
    pub fn respond(&self, pattern: &str, stdout: &str, stderr: &str, exit_code: i64) {
        self.set_reply(
            pattern,
            Reply::Output {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code,
            },
        );
    }

    /// Commands containing `pattern` get a stream that breaks after one frame.
    pub fn fail_stream(&self, pattern: &str) {
        self.set_reply(pattern, Reply::Broken);
    }

    /// The next command containing `pattern` streams whatever is sent on the returned
    /// channel, framed as stdout, until the sender is dropped.
    pub fn live_stream(&self, pattern: &str) -> mpsc::UnboundedSender<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().live_streams.insert(pattern.to_string(), rx);
        tx
    }

    fn set_reply(&self, pattern: &str, reply: Reply) {
        let mut state = self.lock();
        state.replies.retain(|(p, _)| p != pattern);
        state.replies.push((pattern.to_string(), reply));
    }

    pub fn add_image(&self, image: &str) {
        self.lock().images.insert(image.to_string());
    }

    /// Every `(container, command)` executed so far.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.lock().commands.clone()
    }

    pub fn commands_matching(&self, pattern: &str) -> Vec<String> {
        self.lock()
            .commands
            .iter()
            .filter(|(_, cmd)| cmd.contains(pattern))
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    pub fn created(&self) -> Vec<(String, CreateContainerBody)> {
        self.lock().created.clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.lock().pulled.clone()
    }

    pub fn networks(&self) -> Vec<String> {
        self.lock().networks.clone()
    }

    pub fn restarts(&self) -> Vec<String> {
        self.lock().restarts.clone()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lock().find(name).map(|c| c.running).unwrap_or(false)
    }
}

fn framed(stdout: &str, stderr: &str) -> Vec<DockerResult<Bytes>> {
    let mut stream = Vec::new();
    if !stdout.is_empty() {
        stream.extend(encode_frame(StreamKind::Stdout, stdout.as_bytes()));
    }
    if !stderr.is_empty() {
        stream.extend(encode_frame(StreamKind::Stderr, stderr.as_bytes()));
    }
    // Odd chunk size so headers regularly straddle chunk boundaries.
    stream
        .chunks(5)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect()
}

#[async_trait]
impl ContainerRuntimeApi for ScriptedRuntime {
    async fn list_containers(&self, all: bool) -> DockerResult<Vec<ContainerSummary>> {
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|c| all || c.running)
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.name)],
                state: if c.running {
                    ContainerState::Running
                } else {
                    ContainerState::Exited
                },
                labels: c.labels.clone(),
                ..Default::default()
            })
            .collect())
    }

    async fn inspect_container(&self, id_or_name: &str) -> DockerResult<ContainerInspect> {
        let state = self.lock();
        let c = state
            .find(id_or_name)
            .ok_or_else(|| DockerError::NotFound(id_or_name.to_string()))?;
        let mut networks = HashMap::new();
        networks.insert(
            "cloudroom_network".to_string(),
            EndpointSettings {
                ip_address: c.ip.clone(),
            },
        );
        Ok(ContainerInspect {
            id: c.id.clone(),
            name: format!("/{}", c.name),
            state: InspectState {
                running: c.running,
                status: if c.running {
                    ContainerState::Running
                } else {
                    ContainerState::Exited
                },
            },
            network_settings: NetworkSettings { networks },
        })
    }

    async fn create_container(
        &self,
        name: &str,
        body: &CreateContainerBody,
    ) -> DockerResult<String> {
        let mut state = self.lock();
        if state.find(name).is_some() {
            return Err(DockerError::Api {
                operation: "create container",
                status: 409,
                message: format!("name {} in use", name),
            });
        }
        let id = state.next("c");
        let (stopped, _) = watch::channel(true);
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            running: false,
            ip: String::new(),
            labels: body.labels.clone(),
            stopped,
        });
        state.created.push((name.to_string(), body.clone()));
        Ok(id)
    }

    async fn start_container(&self, id_or_name: &str) -> DockerResult<()> {
        let mut state = self.lock();
        let c = state
            .find_mut(id_or_name)
            .ok_or_else(|| DockerError::NotFound(id_or_name.to_string()))?;
        c.running = true;
        let _ = c.stopped.send(false);
        Ok(())
    }

    async fn stop_container(&self, id_or_name: &str, _timeout: Option<u32>) -> DockerResult<()> {
        if self.lock().find(id_or_name).is_none() {
            return Err(DockerError::NotFound(id_or_name.to_string()));
        }
        self.stop(id_or_name);
        Ok(())
    }

    async fn restart_container(&self, id_or_name: &str) -> DockerResult<()> {
        let mut state = self.lock();
        state.restarts.push(id_or_name.to_string());
        let c = state
            .find_mut(id_or_name)
            .ok_or_else(|| DockerError::NotFound(id_or_name.to_string()))?;
        c.running = true;
        Ok(())
    }

    async fn remove_container(&self, id_or_name: &str, _force: bool) -> DockerResult<()> {
        if self.lock().find(id_or_name).is_none() {
            return Err(DockerError::NotFound(id_or_name.to_string()));
        }
        self.vanish(id_or_name);
        Ok(())
    }

    async fn wait_container(&self, id_or_name: &str) -> DockerResult<i64> {
        let mut rx = {
            let state = self.lock();
            state
                .find(id_or_name)
                .ok_or_else(|| DockerError::NotFound(id_or_name.to_string()))?
                .stopped
                .subscribe()
        };
        let _ = rx.wait_for(|stopped| *stopped).await;
        Ok(0)
    }

    async fn create_exec(&self, id_or_name: &str, cmd: Vec<String>) -> DockerResult<String> {
        let mut state = self.lock();
        let running = state
            .find(id_or_name)
            .ok_or_else(|| DockerError::NotFound(id_or_name.to_string()))?
            .running;
        if !running {
            return Err(DockerError::Api {
                operation: "create exec",
                status: 409,
                message: "container is not running".to_string(),
            });
        }
        let command = cmd.last().cloned().unwrap_or_default();
        let exec_id = state.next("e");
        state
            .commands
            .push((id_or_name.to_string(), command.clone()));
        state.execs.insert(
            exec_id.clone(),
            ExecRecord {
                container: id_or_name.to_string(),
                command,
                exit_code: 0,
            },
        );
        Ok(exec_id)
    }

    async fn start_exec(&self, exec_id: &str) -> DockerResult<ExecOutputStream> {
        let mut state = self.lock();
        let command = state
            .execs
            .get(exec_id)
            .map(|e| e.command.clone())
            .ok_or_else(|| DockerError::NotFound(exec_id.to_string()))?;

        let live = state
            .live_streams
            .keys()
            .find(|p| command.contains(p.as_str()))
            .cloned();
        if let Some(pattern) = live
            && let Some(rx) = state.live_streams.remove(&pattern)
        {
            state.live_execs.insert(exec_id.to_string());
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|line| {
                    let frame = encode_frame(StreamKind::Stdout, &line);
                    (Ok(Bytes::from(frame)), rx)
                })
            });
            return Ok(stream.boxed());
        }

        let reply = state
            .replies
            .iter()
            .rev()
            .find(|(p, _)| command.contains(p.as_str()))
            .map(|(_, r)| r.clone());
        match reply {
            Some(Reply::Output {
                stdout,
                stderr,
                exit_code,
            }) => {
                if let Some(record) = state.execs.get_mut(exec_id) {
                    record.exit_code = exit_code;
                }
                Ok(futures::stream::iter(framed(&stdout, &stderr)).boxed())
            }
            Some(Reply::Broken) => {
                let mut items = framed("partial", "");
                items.truncate(1);
                items.push(Err(DockerError::Transport {
                    operation: "exec stream",
                    message: "connection reset".to_string(),
                }));
                Ok(futures::stream::iter(items).boxed())
            }
            None => Ok(futures::stream::empty().boxed()),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> DockerResult<ExecInspect> {
        let state = self.lock();
        let record = state
            .execs
            .get(exec_id)
            .ok_or_else(|| DockerError::NotFound(exec_id.to_string()))?;
        let running = state.live_execs.contains(exec_id);
        Ok(ExecInspect {
            running,
            exit_code: (!running).then_some(record.exit_code),
            pid: 4242,
        })
    }

    async fn list_networks(&self) -> DockerResult<Vec<NetworkSummary>> {
        Ok(self
            .lock()
            .networks
            .iter()
            .map(|n| NetworkSummary {
                id: n.clone(),
                name: n.clone(),
            })
            .collect())
    }

    async fn create_network(&self, name: &str) -> DockerResult<()> {
        self.lock().networks.push(name.to_string());
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> DockerResult<bool> {
        Ok(self.lock().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> DockerResult<()> {
        let mut state = self.lock();
        state.pulled.push(image.to_string());
        state.images.insert(image.to_string());
        Ok(())
    }
}

/// PTY that records input and exits when killed.
#[derive(Default)]
pub struct FakePty {
    written: Mutex<Vec<u8>>,
    size: Mutex<Option<TerminalSize>>,
    resizes: AtomicUsize,
    output: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    exit: Mutex<Option<oneshot::Sender<i32>>>,
}

impl FakePty {
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn resize_count(&self) -> usize {
        self.resizes.load(Ordering::SeqCst)
    }

    /// Produce output as if the shell printed `data`.
    pub async fn emit(&self, data: &[u8]) {
        let tx = self.output.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(data.to_vec()).await;
        }
    }

    pub fn is_alive(&self) -> bool {
        self.exit.lock().unwrap().is_some()
    }
}

impl PtyHandle for FakePty {
    fn write(&self, data: &[u8]) -> Result<()> {
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, size: TerminalSize) -> Result<()> {
        self.resizes.fetch_add(1, Ordering::SeqCst);
        *self.size.lock().unwrap() = Some(size);
        Ok(())
    }

    fn size(&self) -> TerminalSize {
        self.size.lock().unwrap().unwrap_or_default()
    }

    fn kill(&self) {
        self.output.lock().unwrap().take();
        if let Some(tx) = self.exit.lock().unwrap().take() {
            let _ = tx.send(137);
        }
    }
}

/// Spawner handing out [`FakePty`]s.
#[derive(Default)]
pub struct FakePtySpawner {
    spawned: Mutex<Vec<Arc<FakePty>>>,
}

impl FakePtySpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawned(&self) -> Vec<Arc<FakePty>> {
        self.spawned.lock().unwrap().clone()
    }
}

#[async_trait]
impl PtySpawner for FakePtySpawner {
    async fn spawn(&self, _container: &str, _size: TerminalSize) -> Result<SpawnedPty> {
        let (output_tx, output) = mpsc::channel(16);
        let (exit_tx, exit) = oneshot::channel();
        let pty = Arc::new(FakePty::default());
        *pty.output.lock().unwrap() = Some(output_tx);
        *pty.exit.lock().unwrap() = Some(exit_tx);
        self.spawned.lock().unwrap().push(pty.clone());
        Ok(SpawnedPty {
            handle: pty,
            output,
            exit,
        })
    }
}
