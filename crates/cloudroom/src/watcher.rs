//! Workspace change watching.
//!
//! One `inotifywait -m -r` per room streams events over a multiplexed exec. Events are
//! coalesced over a fixed window after the first one; when the window closes the tree is
//! re-snapshotted and published to the room, whether or not it changed.
//!
//! The watch shell prints its own pid before exec'ing `inotifywait`, so the first stdout
//! line is the watcher's pid inside the container. Exec inspect reports host pids, which
//! are useless for signalling from inside.

use cloudroom_protocol::RoomEvent;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::exec::{CommandExecutor, Demuxer, StreamKind};
use crate::files::FileTreeService;
use crate::hub::RoomHub;
use crate::shell::shell_quote;

/// Polls of 100ms `stop_script` makes while waiting for the watcher process to go away.
const STOP_GRACE_STEPS: u32 = 10;

/// `inotifywait` invocation watching `workspace` recursively, skipping `blacklist` names.
///
/// The shell echoes its pid first and then replaces itself with `inotifywait`.
pub fn watch_command(workspace: &str, blacklist: &[String]) -> String {
    let mut command = String::from(
        "echo $$; exec inotifywait -m -r -q -e create -e modify -e delete -e move --format '%e %w%f'",
    );
    if !blacklist.is_empty() {
        let names: Vec<String> = blacklist.iter().map(|n| regex::escape(n)).collect();
        let pattern = format!("(^|/)({})(/|$)", names.join("|"));
        command.push_str(" --exclude ");
        command.push_str(&shell_quote(&pattern));
    }
    command.push(' ');
    command.push_str(&shell_quote(workspace));
    command
}

/// Terminate `pid` and wait for it to disappear. Exits 1 if it is still alive afterwards.
pub fn stop_script(pid: u32) -> String {
    format!(
        "kill {pid} 2>/dev/null; i=0; while [ $i -lt {steps} ]; do \
         kill -0 {pid} 2>/dev/null || exit 0; sleep 0.1; i=$((i+1)); done; exit 1",
        pid = pid,
        steps = STOP_GRACE_STEPS,
    )
}

struct WatchTask {
    generation: u64,
    cancel: CancellationToken,
}

struct Inner {
    executor: CommandExecutor,
    files: FileTreeService,
    hub: Arc<RoomHub>,
    config: Arc<OrchestratorConfig>,
    watches: DashMap<String, WatchTask>,
    generation: AtomicU64,
}

/// Per-room file watchers. At most one per room.
#[derive(Clone)]
pub struct FileWatcher {
    inner: Arc<Inner>,
}

enum StreamEnd {
    Cancelled,
    Finished,
}

impl FileWatcher {
    pub fn new(
        executor: CommandExecutor,
        files: FileTreeService,
        hub: Arc<RoomHub>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                files,
                hub,
                config,
                watches: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start watching a room. A second call for a watched room is a no-op returning false.
    pub fn start(&self, room_id: &str, container: &str) -> bool {
        let cancel = CancellationToken::new();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        match self.inner.watches.entry(room_id.to_string()) {
            Entry::Occupied(_) => {
                debug!("room {} is already watched", room_id);
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(WatchTask {
                    generation,
                    cancel: cancel.clone(),
                });
            }
        }

        let inner = self.inner.clone();
        let room_id = room_id.to_string();
        let container = container.to_string();
        tokio::spawn(async move {
            inner.watch(&room_id, &container, cancel).await;
            inner
                .watches
                .remove_if(&room_id, |_, task| task.generation == generation);
        });
        true
    }

    /// Stop a room's watcher. Returns false if none was running.
    pub fn stop(&self, room_id: &str) -> bool {
        match self.inner.watches.remove(room_id) {
            Some((_, task)) => {
                info!("stopping file watcher for room {}", room_id);
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, room_id: &str) -> bool {
        self.inner.watches.contains_key(room_id)
    }
}

impl Inner {
    async fn watch(&self, room_id: &str, container: &str, cancel: CancellationToken) {
        let command = watch_command(&self.config.workspace_dir, &self.config.tree.blacklist);
        let stream = match self.executor.stream(container, &command).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("file watcher for room {} did not start: {}", room_id, e);
                return;
            }
        };
        info!("watching workspace of room {}", room_id);
        let exec_id = stream.exec_id;
        let mut output = stream.output;
        let mut demuxer = Demuxer::new();
        let window = self.config.watch_debounce();

        let debounce = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(debounce);
        let mut pending = false;
        let mut remote_pid: Option<u32> = None;

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                _ = &mut debounce, if pending => {
                    pending = false;
                    self.resync(room_id).await;
                }
                chunk = output.next() => match chunk {
                    Some(Ok(bytes)) => {
                        let mut saw_event = false;
                        for frame in demuxer.push(&bytes) {
                            let text = String::from_utf8_lossy(&frame.payload);
                            match frame.kind {
                                StreamKind::Stdout => {
                                    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                                        if remote_pid.is_none()
                                            && let Ok(pid) = line.parse::<u32>()
                                        {
                                            debug!("room {} watcher pid {}", room_id, pid);
                                            remote_pid = Some(pid);
                                            continue;
                                        }
                                        debug!("room {} fs event: {}", room_id, line);
                                        saw_event = true;
                                    }
                                }
                                StreamKind::Stderr => {
                                    debug!("room {} watcher: {}", room_id, text.trim_end());
                                }
                            }
                        }
                        if saw_event && !pending {
                            pending = true;
                            debounce.as_mut().reset(Instant::now() + window);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("file watcher stream for room {} failed: {}", room_id, e);
                        break StreamEnd::Finished;
                    }
                    None => {
                        info!("file watcher for room {} ended", room_id);
                        break StreamEnd::Finished;
                    }
                },
            }
        };
        drop(output);

        match end {
            StreamEnd::Finished => {
                if pending {
                    self.resync(room_id).await;
                }
            }
            StreamEnd::Cancelled => {
                self.confirm_stopped(room_id, container, &exec_id, remote_pid)
                    .await
            }
        }
    }

    async fn resync(&self, room_id: &str) {
        match self.files.get_file_tree(room_id).await {
            Ok(tree) => {
                self.hub
                    .publish(room_id, RoomEvent::DirectoryChanged { tree })
                    .await
            }
            Err(e) => warn!("resync of room {} failed: {}", room_id, e),
        }
    }

    /// Best effort: make sure the remote watcher process is gone. Failures are logged.
    async fn confirm_stopped(
        &self,
        room_id: &str,
        container: &str,
        exec_id: &str,
        remote_pid: Option<u32>,
    ) {
        match self.executor.runtime().inspect_exec(exec_id).await {
            Ok(inspect) if !inspect.running => {
                debug!("watcher of room {} stopped", room_id);
                return;
            }
            Ok(_) => {}
            Err(e) => debug!("could not inspect watcher of room {}: {}", room_id, e),
        }
        let Some(pid) = remote_pid else {
            warn!(
                "watcher of room {} may still be running: its pid was never reported",
                room_id
            );
            return;
        };
        match self.executor.run(container, &stop_script(pid)).await {
            Ok(output) if output.success() => {
                debug!("watcher process {} of room {} stopped", pid, room_id)
            }
            Ok(_) => warn!(
                "watcher process {} of room {} is still running after kill",
                pid, room_id
            ),
            Err(e) => warn!(
                "could not stop watcher process {} of room {}: {}",
                pid, room_id, e
            ),
        }
    }
}
