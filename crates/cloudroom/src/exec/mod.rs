//! Command execution inside room containers.
//!
//! Every in-container command funnels through [`CommandExecutor`]: it opens a non-TTY
//! exec, demultiplexes the engine's stream into stdout and stderr, and reads the exit code
//! once the stream ends.

pub mod demux;

pub use demux::{DemuxedOutput, Demuxer, Frame, StreamKind};

use futures::StreamExt;
use log::debug;
use std::sync::Arc;

use crate::docker::{ContainerRuntimeApi, DockerError, ExecOutputStream};
use crate::error::{OrchestratorError, Result};

/// Captured result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A running exec whose output is consumed by the caller.
pub struct ExecStream {
    pub exec_id: String,
    pub output: ExecOutputStream,
}

/// Runs shell commands in containers through the engine API.
#[derive(Clone)]
pub struct CommandExecutor {
    runtime: Arc<dyn ContainerRuntimeApi>,
}

impl CommandExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntimeApi> {
        &self.runtime
    }

    /// Fail with `ContainerUnavailable` unless the container exists and is running.
    pub async fn ensure_running(&self, container: &str) -> Result<()> {
        match self.runtime.inspect_container(container).await {
            Ok(info) if info.state.running => Ok(()),
            Ok(info) => Err(OrchestratorError::unavailable(
                container,
                format!("container is {}", info.state.status),
            )),
            Err(e) if e.is_not_found() => {
                Err(OrchestratorError::unavailable(container, "no such container"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run `command` through `sh -c` and return everything it produced.
    ///
    /// The exit code is reported but not checked.
    pub async fn run(&self, container: &str, command: &str) -> Result<ExecOutput> {
        self.ensure_running(container).await?;
        let stream = self.open(container, command).await?;
        let exec_id = stream.exec_id.clone();
        let output = collect(stream.output).await?;

        let inspect = self.runtime.inspect_exec(&exec_id).await?;
        let exit_code = inspect.exit_code.unwrap_or(-1);
        if !output.stderr.is_empty() {
            debug!(
                "exec in {} exited {} with stderr: {}",
                container,
                exit_code,
                output.stderr_lossy().trim_end()
            );
        }

        Ok(ExecOutput {
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            exit_code,
        })
    }

    /// Run a command, require exit code 0 and return its stdout untrimmed.
    pub async fn exec_raw(&self, container: &str, command: &str) -> Result<String> {
        let output = self.run(container, command).await?;
        if !output.success() {
            return Err(OrchestratorError::CommandFailed {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Run a command, require exit code 0 and return its trimmed stdout.
    pub async fn exec(&self, container: &str, command: &str) -> Result<String> {
        let stdout = self.exec_raw(container, command).await?;
        Ok(stdout.trim().to_string())
    }

    /// Start a long-lived command and hand its raw multiplexed stream to the caller.
    pub async fn stream(&self, container: &str, command: &str) -> Result<ExecStream> {
        self.ensure_running(container).await?;
        self.open(container, command).await
    }

    async fn open(&self, container: &str, command: &str) -> Result<ExecStream> {
        let cmd = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        let exec_id = self
            .runtime
            .create_exec(container, cmd)
            .await
            .map_err(|e| unavailable_or(container, e))?;
        let output = self
            .runtime
            .start_exec(&exec_id)
            .await
            .map_err(|e| unavailable_or(container, e))?;
        Ok(ExecStream { exec_id, output })
    }
}

fn unavailable_or(container: &str, e: DockerError) -> OrchestratorError {
    if e.is_not_found() {
        OrchestratorError::unavailable(container, e.to_string())
    } else {
        e.into()
    }
}

/// Drain a multiplexed stream into separate stdout and stderr buffers.
pub async fn collect(mut stream: ExecOutputStream) -> Result<DemuxedOutput> {
    let mut demuxer = Demuxer::new();
    let mut output = DemuxedOutput::default();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| OrchestratorError::ExecStreamError(e.to_string()))?;
        for frame in demuxer.push(&chunk) {
            output.append(&frame);
        }
    }
    if demuxer.pending() > 0 {
        debug!("exec stream ended with {} unframed bytes", demuxer.pending());
    }
    Ok(output)
}
