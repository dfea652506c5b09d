//! In-memory engine for integration tests.
//!
//! Containers carry a small path set standing in for their filesystem. Exec commands are
//! tokenised like `/bin/sh` would and the handful of utilities the orchestrator uses
//! (`find`, `rm`, `mkdir`, `touch`, `mv`, `cat`, `printf`, `[ -e ]`) are interpreted against
//! that path set. Output goes back over the real multiplexed framing.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};

use cloudroom::docker::types::{EndpointSettings, InspectState, NetworkSettings};
use cloudroom::docker::{
    ContainerInspect, ContainerRuntimeApi, ContainerState, ContainerSummary, CreateContainerBody,
    DockerError, DockerResult, ExecInspect, ExecOutputStream, NetworkSummary,
};
use cloudroom::exec::demux::{StreamKind, encode_frame};
use cloudroom::terminal::{PtyHandle, PtySpawner, SpawnedPty, TerminalSize};

pub const WORKSPACE: &str = "/workspace";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Folder,
    File(String),
}

struct Container {
    id: String,
    name: String,
    running: bool,
    image: String,
    labels: HashMap<String, String>,
    files: BTreeMap<String, Entry>,
    stopped: watch::Sender<bool>,
}

impl Container {
    fn new(id: String, name: &str, running: bool, labels: HashMap<String, String>) -> Self {
        let (stopped, _) = watch::channel(!running);
        let mut files = BTreeMap::new();
        files.insert(WORKSPACE.to_string(), Entry::Folder);
        Self {
            id,
            name: name.to_string(),
            running,
            image: String::new(),
            labels,
            files,
            stopped,
        }
    }
}

struct ExecRecord {
    container: String,
    command: String,
    exit_code: i64,
}

#[derive(Default)]
struct State {
    containers: Vec<Container>,
    execs: HashMap<String, ExecRecord>,
    commands: Vec<String>,
    live: HashMap<String, mpsc::UnboundedReceiver<Vec<u8>>>,
    networks: Vec<String>,
    images: HashSet<String>,
    /// Images whose containers fail to start.
    broken_images: HashSet<String>,
    next_id: u64,
}

impl State {
    fn find(&self, id_or_name: &str) -> Option<&Container> {
        self.containers
            .iter()
            .find(|c| c.id == id_or_name || c.name == id_or_name)
    }

    fn find_mut(&mut self, id_or_name: &str) -> Option<&mut Container> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id_or_name || c.name == id_or_name)
    }

    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:012x}", prefix, self.next_id)
    }
}

#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<State>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Register a running container with an empty workspace and return its id.
    pub fn add_container(&self, name: &str) -> String {
        let mut state = self.lock();
        let id = state.next("c");
        state
            .containers
            .push(Container::new(id.clone(), name, true, HashMap::new()));
        id
    }

    /// Remove a container behind the orchestrator's back.
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

    pub fn exists(&self, name: &str) -> bool {
        self.lock().find(name).is_some()
    }

    /// Paths in a container's filesystem, folders suffixed with `/`.
    pub fn paths(&self, name: &str) -> Vec<String> {
        let state = self.lock();
        let Some(c) = state.find(name) else {
            return Vec::new();
        };
        c.files
            .iter()
            .map(|(path, entry)| match entry {
                Entry::Folder => format!("{}/", path),
                Entry::File(_) => path.clone(),
            })
            .collect()
    }

    pub fn put_file(&self, name: &str, path: &str, content: &str) {
        if let Some(c) = self.lock().find_mut(name) {
            mkdir_p(&mut c.files, parent(path));
            c.files
                .insert(path.to_string(), Entry::File(content.to_string()));
        }
    }

    pub fn content(&self, name: &str, path: &str) -> Option<String> {
        match self.lock().find(name)?.files.get(path)? {
            Entry::File(content) => Some(content.clone()),
            Entry::Folder => None,
        }
    }

    /// Commands executed so far that contain `pattern`.
    pub fn commands_matching(&self, pattern: &str) -> Vec<String> {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.contains(pattern))
            .cloned()
            .collect()
    }

    /// The next command containing `pattern` streams whatever is sent on the returned
    /// channel until the sender is dropped.
    pub fn live_stream(&self, pattern: &str) -> mpsc::UnboundedSender<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().live.insert(pattern.to_string(), rx);
        tx
    }

    /// Containers created from `image` are created fine but refuse to start.
    pub fn break_image(&self, image: &str) {
        self.lock().broken_images.insert(image.to_string());
    }

    pub fn fix_image(&self, image: &str) {
        self.lock().broken_images.remove(image);
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// True if `path` or one of its ancestors is a regular file.
fn blocked_by_file(files: &BTreeMap<String, Entry>, path: &str) -> bool {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        if matches!(files.get(&current), Some(Entry::File(_))) {
            return true;
        }
    }
    false
}

fn mkdir_p(files: &mut BTreeMap<String, Entry>, path: &str) {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        files.entry(current.clone()).or_insert(Entry::Folder);
    }
}

fn remove_tree(files: &mut BTreeMap<String, Entry>, path: &str) {
    let prefix = format!("{}/", path);
    files.retain(|p, _| p != path && !p.starts_with(&prefix));
}

/// Split a command line into words and operators the way `/bin/sh` does for the subset
/// of quoting the orchestrator emits.
fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = command.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    word.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    word.push(next);
                }
            }
            ';' => {
                if in_word {
                    tokens.push(std::mem::take(&mut word));
                    in_word = false;
                }
                tokens.push(";".to_string());
            }
            c if c.is_whitespace() => {
                if in_word {
                    tokens.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        tokens.push(word);
    }
    tokens
}

struct Outcome {
    stdout: String,
    exit_code: i64,
}

enum Flow {
    Continue(i64),
    Exit(i64),
}

fn run_script(files: &mut BTreeMap<String, Entry>, command: &str) -> Outcome {
    let tokens = tokenize(command);
    let mut stdout = String::new();
    let mut status = 0;
    for statement in tokens.split(|t| t == ";") {
        if statement.is_empty() {
            continue;
        }
        let mut simple: Vec<&[String]> = Vec::new();
        let mut ops: Vec<&str> = Vec::new();
        let mut start = 0;
        for (idx, token) in statement.iter().enumerate() {
            if token == "&&" || token == "||" {
                simple.push(&statement[start..idx]);
                ops.push(token.as_str());
                start = idx + 1;
            }
        }
        simple.push(&statement[start..]);

        let mut last = match run_simple(files, simple[0], &mut stdout) {
            Flow::Exit(code) => {
                return Outcome {
                    stdout,
                    exit_code: code,
                };
            }
            Flow::Continue(code) => code,
        };
        for (op, words) in ops.iter().zip(simple.iter().skip(1)) {
            let run = (*op == "&&" && last == 0) || (*op == "||" && last != 0);
            if !run {
                continue;
            }
            last = match run_simple(files, words, &mut stdout) {
                Flow::Exit(code) => {
                    return Outcome {
                        stdout,
                        exit_code: code,
                    };
                }
                Flow::Continue(code) => code,
            };
        }
        status = last;
    }
    Outcome {
        stdout,
        exit_code: status,
    }
}

fn operands(words: &[String]) -> Vec<&str> {
    words
        .iter()
        .skip(1)
        .map(String::as_str)
        .filter(|w| !w.starts_with('-'))
        .collect()
}

fn run_simple(files: &mut BTreeMap<String, Entry>, words: &[String], out: &mut String) -> Flow {
    let Some(program) = words.first() else {
        return Flow::Continue(0);
    };
    let code = match program.as_str() {
        "exit" => {
            return Flow::Exit(words.get(1).and_then(|c| c.parse().ok()).unwrap_or(0));
        }
        "[" => match (words.get(1).map(String::as_str), words.get(2)) {
            (Some("-e"), Some(path)) => i64::from(!files.contains_key(path.as_str())),
            _ => 1,
        },
        "find" => {
            let root = words.get(1).cloned().unwrap_or_default();
            let pruned: Vec<&str> = words
                .windows(2)
                .filter(|w| w[0] == "-name")
                .map(|w| w[1].as_str())
                .collect();
            for (path, entry) in files.iter() {
                if path != &root && !path.starts_with(&format!("{}/", root)) {
                    continue;
                }
                if path
                    .split('/')
                    .any(|segment| pruned.contains(&segment))
                {
                    continue;
                }
                let (kind, size) = match entry {
                    Entry::Folder => ('d', 4096),
                    Entry::File(content) => ('f', content.len()),
                };
                out.push_str(&format!("{}|{}|{}|1700000000.0\n", kind, path, size));
            }
            0
        }
        "rm" => {
            for path in operands(words) {
                remove_tree(files, path);
            }
            0
        }
        "mkdir" => {
            let mut code = 0;
            for path in operands(words) {
                if blocked_by_file(files, path) {
                    code = 1;
                    continue;
                }
                mkdir_p(files, path);
            }
            code
        }
        "touch" => {
            let mut code = 0;
            for path in operands(words) {
                if files.get(parent(path)) != Some(&Entry::Folder) {
                    code = 1;
                    continue;
                }
                files
                    .entry(path.to_string())
                    .or_insert_with(|| Entry::File(String::new()));
            }
            code
        }
        "mv" => {
            let paths = operands(words);
            match paths.as_slice() {
                [from, to] if files.contains_key(*from) => {
                    let prefix = format!("{}/", from);
                    let moved: Vec<(String, Entry)> = files
                        .iter()
                        .filter(|(p, _)| p.as_str() == *from || p.starts_with(&prefix))
                        .map(|(p, e)| (format!("{}{}", to, &p[from.len()..]), e.clone()))
                        .collect();
                    remove_tree(files, from);
                    files.extend(moved);
                    0
                }
                _ => 1,
            }
        }
        "cat" => match operands(words).first().and_then(|p| files.get(*p)) {
            Some(Entry::File(content)) => {
                out.push_str(content);
                0
            }
            _ => 1,
        },
        "printf" => {
            // printf '%s' <content> > <path>
            match words {
                [_, _, content, redirect, path] if redirect == ">" => {
                    files.insert(path.clone(), Entry::File(content.clone()));
                    0
                }
                _ => 1,
            }
        }
        _ => 0,
    };
    Flow::Continue(code)
}

fn framed(stdout: &str) -> Vec<DockerResult<Bytes>> {
    if stdout.is_empty() {
        return Vec::new();
    }
    let frame = encode_frame(StreamKind::Stdout, stdout.as_bytes());
    frame
        .chunks(7)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect()
}

#[async_trait]
impl ContainerRuntimeApi for FakeEngine {
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
                ip_address: "172.18.0.2".to_string(),
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
        let mut container = Container::new(id.clone(), name, false, body.labels.clone());
        container.image = body.image.clone();
        state.containers.push(container);
        Ok(id)
    }

    async fn start_container(&self, id_or_name: &str) -> DockerResult<()> {
        let mut state = self.lock();
        let broken = state.broken_images.clone();
        let c = state
            .find_mut(id_or_name)
            .ok_or_else(|| DockerError::NotFound(id_or_name.to_string()))?;
        if broken.contains(&c.image) {
            return Err(DockerError::Api {
                operation: "start container",
                status: 500,
                message: "OCI runtime create failed".to_string(),
            });
        }
        c.running = true;
        let _ = c.stopped.send(false);
        Ok(())
    }

    async fn stop_container(&self, id_or_name: &str, _timeout: Option<u32>) -> DockerResult<()> {
        let mut state = self.lock();
        let c = state
            .find_mut(id_or_name)
            .ok_or_else(|| DockerError::NotFound(id_or_name.to_string()))?;
        c.running = false;
        let _ = c.stopped.send(true);
        Ok(())
    }

    async fn restart_container(&self, id_or_name: &str) -> DockerResult<()> {
        self.start_container(id_or_name).await
    }

    async fn remove_container(&self, id_or_name: &str, _force: bool) -> DockerResult<()> {
        if !self.exists(id_or_name) {
            return Err(DockerError::NotFound(id_or_name.to_string()));
        }
        self.vanish(id_or_name);
        Ok(())
    }

    async fn wait_container(&self, id_or_name: &str) -> DockerResult<i64> {
        let mut rx = self
            .lock()
            .find(id_or_name)
            .ok_or_else(|| DockerError::NotFound(id_or_name.to_string()))?
            .stopped
            .subscribe();
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
        state.commands.push(command.clone());
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
        let (container, command) = state
            .execs
            .get(exec_id)
            .map(|e| (e.container.clone(), e.command.clone()))
            .ok_or_else(|| DockerError::NotFound(exec_id.to_string()))?;

        let live = state
            .live
            .keys()
            .find(|p| command.contains(p.as_str()))
            .cloned();
        if let Some(rx) = live.and_then(|p| state.live.remove(&p)) {
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| {
                    let frame = encode_frame(StreamKind::Stdout, &chunk);
                    (Ok(Bytes::from(frame)), rx)
                })
            });
            return Ok(stream.boxed());
        }

        let c = state
            .find_mut(&container)
            .ok_or_else(|| DockerError::NotFound(container.clone()))?;
        let outcome = run_script(&mut c.files, &command);
        if let Some(record) = state.execs.get_mut(exec_id) {
            record.exit_code = outcome.exit_code;
        }
        Ok(futures::stream::iter(framed(&outcome.stdout)).boxed())
    }

    async fn inspect_exec(&self, exec_id: &str) -> DockerResult<ExecInspect> {
        let state = self.lock();
        let record = state
            .execs
            .get(exec_id)
            .ok_or_else(|| DockerError::NotFound(exec_id.to_string()))?;
        Ok(ExecInspect {
            running: false,
            exit_code: Some(record.exit_code),
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
        self.lock().images.insert(image.to_string());
        Ok(())
    }
}

/// PTY that echoes nothing and exits when killed.
#[derive(Default)]
pub struct TestPty {
    written: Mutex<Vec<u8>>,
    size: Mutex<Option<TerminalSize>>,
    output: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    exit: Mutex<Option<oneshot::Sender<i32>>>,
}

impl TestPty {
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn is_alive(&self) -> bool {
        self.exit.lock().unwrap().is_some()
    }

    pub async fn emit(&self, data: &[u8]) {
        let tx = self.output.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(data.to_vec()).await;
        }
    }
}

impl PtyHandle for TestPty {
    fn write(&self, data: &[u8]) -> cloudroom::Result<()> {
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, size: TerminalSize) -> cloudroom::Result<()> {
        *self.size.lock().unwrap() = Some(size);
        Ok(())
    }

    fn size(&self) -> TerminalSize {
        self.size.lock().unwrap().unwrap_or_default()
    }

    fn kill(&self) {
        self.output.lock().unwrap().take();
        if let Some(exit) = self.exit.lock().unwrap().take() {
            let _ = exit.send(137);
        }
    }
}

#[derive(Default)]
pub struct TestPtySpawner {
    spawned: Mutex<Vec<Arc<TestPty>>>,
    spawn_count: AtomicUsize,
}

impl TestPtySpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawned(&self) -> Vec<Arc<TestPty>> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PtySpawner for TestPtySpawner {
    async fn spawn(&self, _container: &str, _size: TerminalSize) -> cloudroom::Result<SpawnedPty> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        let (output_tx, output) = mpsc::channel(16);
        let (exit_tx, exit) = oneshot::channel();
        let pty = Arc::new(TestPty::default());
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
