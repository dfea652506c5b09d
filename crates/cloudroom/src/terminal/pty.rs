//! Pseudo-terminals running `docker exec -it` into a room container.

use async_trait::async_trait;
use log::{debug, warn};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::docker::validate_container_id_or_name;
use crate::error::{OrchestratorError, Result};
use crate::shell::shell_quote;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub const MIN_COLS: u16 = 10;
    pub const MIN_ROWS: u16 = 5;

    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Reject sizes below 10 columns or 5 rows.
    pub fn validate(&self) -> Result<()> {
        if self.cols < Self::MIN_COLS || self.rows < Self::MIN_ROWS {
            return Err(OrchestratorError::InvalidInput(format!(
                "terminal size {}x{} below minimum {}x{}",
                self.cols,
                self.rows,
                Self::MIN_COLS,
                Self::MIN_ROWS
            )));
        }
        Ok(())
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Control side of a running PTY process.
pub trait PtyHandle: Send + Sync {
    /// Queue raw bytes for the process input. Writes are applied in call order.
    fn write(&self, data: &[u8]) -> Result<()>;
    fn resize(&self, size: TerminalSize) -> Result<()>;
    fn size(&self) -> TerminalSize;
    fn kill(&self);
}

/// A freshly spawned PTY: its handle, its output chunks and its exit code.
pub struct SpawnedPty {
    pub handle: Arc<dyn PtyHandle>,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub exit: oneshot::Receiver<i32>,
}

/// Starts an interactive shell inside a container.
#[async_trait]
pub trait PtySpawner: Send + Sync {
    async fn spawn(&self, container: &str, size: TerminalSize) -> Result<SpawnedPty>;
}

/// Spawns `<docker> exec -it <container> /bin/sh -c "cd <workspace> && exec bash"`.
pub struct DockerPtySpawner {
    docker_binary: String,
    workspace_dir: String,
}

impl DockerPtySpawner {
    pub fn new(docker_binary: impl Into<String>, workspace_dir: impl Into<String>) -> Self {
        Self {
            docker_binary: docker_binary.into(),
            workspace_dir: workspace_dir.into(),
        }
    }

    /// Arguments passed to the docker binary.
    pub fn exec_args(&self, container: &str) -> Vec<String> {
        let script = format!(
            "cd {} && if command -v bash >/dev/null 2>&1; then exec bash; else exec sh; fi",
            shell_quote(&self.workspace_dir)
        );
        vec![
            "exec".to_string(),
            "-it".to_string(),
            "-e".to_string(),
            "TERM=xterm-256color".to_string(),
            container.to_string(),
            "/bin/sh".to_string(),
            "-c".to_string(),
            script,
        ]
    }
}

fn pty_error(what: &str, e: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::Terminal(format!("{}: {}", what, e))
}

#[async_trait]
impl PtySpawner for DockerPtySpawner {
    async fn spawn(&self, container: &str, size: TerminalSize) -> Result<SpawnedPty> {
        validate_container_id_or_name(container)?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| pty_error("openpty", e))?;

        let mut command = CommandBuilder::new(&self.docker_binary);
        command.args(self.exec_args(container));
        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| pty_error("spawn docker exec", e))?;
        drop(pair.slave);
        let killer = child.clone_killer();

        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(256);
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| pty_error("clone pty reader", e))?;
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    Err(e) => {
                        debug!("pty read ended: {}", e);
                        break;
                    }
                }
            }
        });

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| pty_error("take pty writer", e))?;
        let writer = Arc::new(StdMutex::new(writer));
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                let writer = writer.clone();
                let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                    let mut guard = writer
                        .lock()
                        .map_err(|_| std::io::Error::other("pty writer poisoned"))?;
                    guard.write_all(&bytes)?;
                    guard.flush()
                })
                .await;
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("pty write failed: {}", e);
                        break;
                    }
                    Err(e) => {
                        warn!("pty write task failed: {}", e);
                        break;
                    }
                }
            }
        });

        let (exit_tx, exit_rx) = oneshot::channel::<i32>();
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(_) => -1,
            };
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedPty {
            handle: Arc::new(DockerPty {
                master: StdMutex::new(pair.master),
                writer_tx,
                killer: StdMutex::new(killer),
                size: StdMutex::new(size),
            }),
            output: output_rx,
            exit: exit_rx,
        })
    }
}

struct DockerPty {
    master: StdMutex<Box<dyn MasterPty + Send>>,
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    size: StdMutex<TerminalSize>,
}

impl PtyHandle for DockerPty {
    fn write(&self, data: &[u8]) -> Result<()> {
        self.writer_tx
            .send(data.to_vec())
            .map_err(|_| OrchestratorError::Terminal("terminal input closed".to_string()))
    }

    fn resize(&self, size: TerminalSize) -> Result<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| OrchestratorError::Terminal("pty lock poisoned".to_string()))?;
        master
            .resize(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| pty_error("resize", e))?;
        if let Ok(mut current) = self.size.lock() {
            *current = size;
        }
        Ok(())
    }

    fn size(&self) -> TerminalSize {
        self.size.lock().map(|s| *s).unwrap_or_default()
    }

    fn kill(&self) {
        if let Ok(mut killer) = self.killer.lock()
            && let Err(e) = killer.kill()
        {
            debug!("pty kill: {}", e);
        }
    }
}
