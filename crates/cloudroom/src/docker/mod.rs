//! Container engine access.
//!
//! Talks to the Docker Engine HTTP API over its Unix socket. Every component of the
//! orchestrator goes through [`ContainerRuntimeApi`] so it can run against a fake engine
//! in tests.

mod error;
pub mod types;

pub use error::{DockerError, DockerResult};
pub use types::{
    ContainerInspect, ContainerState, ContainerSummary, CreateContainerBody, EmptyObject,
    ExecInspect, HostConfig, NetworkSummary, PortBinding,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use http_body_util::{BodyExt, BodyStream, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use log::debug;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

use types::{
    CreateExecBody, CreateNetworkBody, IdResponse, StartExecBody, WaitResponse,
};

/// Raw output of an exec instance, exactly as the engine sends it.
///
/// For non-TTY execs this is the multiplexed stdout/stderr framing.
pub type ExecOutputStream = BoxStream<'static, DockerResult<Bytes>>;

/// Container engine abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    async fn list_containers(&self, all: bool) -> DockerResult<Vec<ContainerSummary>>;
    async fn inspect_container(&self, id_or_name: &str) -> DockerResult<ContainerInspect>;

    /// Create a container and return its id.
    async fn create_container(&self, name: &str, body: &CreateContainerBody)
    -> DockerResult<String>;
    async fn start_container(&self, id_or_name: &str) -> DockerResult<()>;
    async fn stop_container(
        &self,
        id_or_name: &str,
        timeout_seconds: Option<u32>,
    ) -> DockerResult<()>;
    async fn restart_container(&self, id_or_name: &str) -> DockerResult<()>;
    async fn remove_container(&self, id_or_name: &str, force: bool) -> DockerResult<()>;

    /// Block until the container stops and return its exit code.
    async fn wait_container(&self, id_or_name: &str) -> DockerResult<i64>;

    /// Create a non-TTY exec instance with stdout and stderr attached.
    async fn create_exec(&self, id_or_name: &str, cmd: Vec<String>) -> DockerResult<String>;
    async fn start_exec(&self, exec_id: &str) -> DockerResult<ExecOutputStream>;
    async fn inspect_exec(&self, exec_id: &str) -> DockerResult<ExecInspect>;

    async fn list_networks(&self) -> DockerResult<Vec<NetworkSummary>>;
    async fn create_network(&self, name: &str) -> DockerResult<()>;

    async fn image_exists(&self, image: &str) -> DockerResult<bool>;
    async fn pull_image(&self, image: &str) -> DockerResult<()>;
}

/// Validate a container ID or name before it is put into a request path.
///
/// Container IDs are hex strings, names are alphanumeric with `-`, `_` and `.`.
pub fn validate_container_id_or_name(id: &str) -> DockerResult<()> {
    if id.is_empty() {
        return Err(DockerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(DockerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
    if !id.chars().all(valid_chars) {
        return Err(DockerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

fn validate_image_name(image: &str) -> DockerResult<()> {
    if image.is_empty() || image.len() > 256 {
        return Err(DockerError::InvalidInput(format!(
            "invalid image name '{}'",
            image
        )));
    }
    let valid_chars =
        |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@');
    if !image.chars().all(valid_chars) {
        return Err(DockerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }
    Ok(())
}

/// Docker Engine API client over a Unix socket.
#[derive(Clone)]
pub struct DockerClient {
    socket: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl std::fmt::Debug for DockerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerClient")
            .field("socket", &self.socket)
            .finish()
    }
}

impl DockerClient {
    /// Create a client for the engine listening on `socket`.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            client: Client::unix(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        operation: &'static str,
    ) -> DockerResult<Response<Incoming>> {
        let uri: Uri = UnixUri::new(&self.socket, path).into();
        debug!("engine {} {} {}", operation, method, path);

        let mut builder = Request::builder().method(method).uri(uri);
        let request_body = match body {
            Some(payload) => {
                builder = builder.header("content-type", "application/json");
                Full::new(Bytes::from(payload))
            }
            None => Full::new(Bytes::new()),
        };
        let request = builder
            .body(request_body)
            .map_err(|e| DockerError::Transport {
                operation,
                message: e.to_string(),
            })?;

        self.client
            .request(request)
            .await
            .map_err(|e| DockerError::Transport {
                operation,
                message: e.to_string(),
            })
    }

    async fn send_json<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        operation: &'static str,
    ) -> DockerResult<Response<Incoming>> {
        let payload = serde_json::to_vec(body).map_err(|source| DockerError::Decode {
            operation,
            source,
        })?;
        self.send(method, path, Some(payload), operation).await
    }

    /// Issue a request and fail on any status other than 2xx/304.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        operation: &'static str,
    ) -> DockerResult<Bytes> {
        let response = self.send(method, path, body, operation).await?;
        let status = response.status();
        let bytes = collect_body(response, operation).await?;
        check_status(status, &bytes, operation)?;
        Ok(bytes)
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        operation: &'static str,
    ) -> DockerResult<T> {
        let bytes = self.call(method, path, body, operation).await?;
        serde_json::from_slice(&bytes).map_err(|source| DockerError::Decode { operation, source })
    }
}

async fn collect_body(response: Response<Incoming>, operation: &'static str) -> DockerResult<Bytes> {
    Ok(response
        .into_body()
        .collect()
        .await
        .map_err(|e| DockerError::Transport {
            operation,
            message: e.to_string(),
        })?
        .to_bytes())
}

/// Map an engine status code to a result. 304 means "already in that state".
fn check_status(status: StatusCode, body: &[u8], operation: &'static str) -> DockerResult<()> {
    if status.is_success() || status == StatusCode::NOT_MODIFIED {
        return Ok(());
    }
    let message = engine_message(body);
    if status == StatusCode::NOT_FOUND {
        return Err(DockerError::NotFound(format!("{}: {}", operation, message)));
    }
    Err(DockerError::Api {
        operation,
        status: status.as_u16(),
        message,
    })
}

/// The engine reports failures as `{"message": "..."}`.
fn engine_message(body: &[u8]) -> String {
    #[derive(serde::Deserialize)]
    struct EngineMessage {
        message: String,
    }
    match serde_json::from_slice::<EngineMessage>(body) {
        Ok(parsed) => parsed.message,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}

/// Find the first `{"error": ...}` record in an image pull progress stream.
fn pull_error(body: &[u8]) -> Option<String> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .find_map(|record| {
            record
                .get("error")
                .and_then(|e| e.as_str())
                .map(str::to_string)
        })
}

#[async_trait]
impl ContainerRuntimeApi for DockerClient {
    async fn list_containers(&self, all: bool) -> DockerResult<Vec<ContainerSummary>> {
        let path = format!("/containers/json?all={}", all);
        self.call_json(Method::GET, &path, None, "list containers")
            .await
    }

    async fn inspect_container(&self, id_or_name: &str) -> DockerResult<ContainerInspect> {
        validate_container_id_or_name(id_or_name)?;
        let path = format!("/containers/{}/json", id_or_name);
        self.call_json(Method::GET, &path, None, "inspect container")
            .await
    }

    async fn create_container(
        &self,
        name: &str,
        body: &CreateContainerBody,
    ) -> DockerResult<String> {
        validate_container_id_or_name(name)?;
        validate_image_name(&body.image)?;
        let path = format!("/containers/create?name={}", urlencoding::encode(name));
        let response = self
            .send_json(Method::POST, &path, body, "create container")
            .await?;
        let status = response.status();
        let bytes = collect_body(response, "create container").await?;
        check_status(status, &bytes, "create container")?;
        let created: IdResponse =
            serde_json::from_slice(&bytes).map_err(|source| DockerError::Decode {
                operation: "create container",
                source,
            })?;
        Ok(created.id)
    }

    async fn start_container(&self, id_or_name: &str) -> DockerResult<()> {
        validate_container_id_or_name(id_or_name)?;
        let path = format!("/containers/{}/start", id_or_name);
        self.call(Method::POST, &path, None, "start container")
            .await
            .map(|_| ())
    }

    async fn stop_container(
        &self,
        id_or_name: &str,
        timeout_seconds: Option<u32>,
    ) -> DockerResult<()> {
        validate_container_id_or_name(id_or_name)?;
        let path = match timeout_seconds {
            Some(t) => format!("/containers/{}/stop?t={}", id_or_name, t),
            None => format!("/containers/{}/stop", id_or_name),
        };
        self.call(Method::POST, &path, None, "stop container")
            .await
            .map(|_| ())
    }

    async fn restart_container(&self, id_or_name: &str) -> DockerResult<()> {
        validate_container_id_or_name(id_or_name)?;
        let path = format!("/containers/{}/restart", id_or_name);
        self.call(Method::POST, &path, None, "restart container")
            .await
            .map(|_| ())
    }

    async fn remove_container(&self, id_or_name: &str, force: bool) -> DockerResult<()> {
        validate_container_id_or_name(id_or_name)?;
        let path = format!("/containers/{}?force={}&v=true", id_or_name, force);
        self.call(Method::DELETE, &path, None, "remove container")
            .await
            .map(|_| ())
    }

    async fn wait_container(&self, id_or_name: &str) -> DockerResult<i64> {
        validate_container_id_or_name(id_or_name)?;
        let path = format!("/containers/{}/wait", id_or_name);
        let waited: WaitResponse = self
            .call_json(Method::POST, &path, None, "wait container")
            .await?;
        Ok(waited.status_code)
    }

    async fn create_exec(&self, id_or_name: &str, cmd: Vec<String>) -> DockerResult<String> {
        validate_container_id_or_name(id_or_name)?;
        let path = format!("/containers/{}/exec", id_or_name);
        let body = CreateExecBody {
            cmd,
            attach_stdout: true,
            attach_stderr: true,
            attach_stdin: false,
            tty: false,
            working_dir: None,
        };
        let response = self
            .send_json(Method::POST, &path, &body, "create exec")
            .await?;
        let status = response.status();
        let bytes = collect_body(response, "create exec").await?;
        check_status(status, &bytes, "create exec")?;
        let created: IdResponse =
            serde_json::from_slice(&bytes).map_err(|source| DockerError::Decode {
                operation: "create exec",
                source,
            })?;
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str) -> DockerResult<ExecOutputStream> {
        validate_container_id_or_name(exec_id)?;
        let path = format!("/exec/{}/start", exec_id);
        let body = StartExecBody {
            detach: false,
            tty: false,
        };
        let response = self
            .send_json(Method::POST, &path, &body, "start exec")
            .await?;
        let status = response.status();
        if !status.is_success() {
            let bytes = collect_body(response, "start exec").await?;
            check_status(status, &bytes, "start exec")?;
            return Ok(futures::stream::empty().boxed());
        }

        let stream = BodyStream::new(response.into_body()).filter_map(|frame| async move {
            match frame {
                Ok(frame) => frame.into_data().ok().map(Ok),
                Err(e) => Some(Err(DockerError::Transport {
                    operation: "exec stream",
                    message: e.to_string(),
                })),
            }
        });
        Ok(stream.boxed())
    }

    async fn inspect_exec(&self, exec_id: &str) -> DockerResult<ExecInspect> {
        validate_container_id_or_name(exec_id)?;
        let path = format!("/exec/{}/json", exec_id);
        self.call_json(Method::GET, &path, None, "inspect exec")
            .await
    }

    async fn list_networks(&self) -> DockerResult<Vec<NetworkSummary>> {
        self.call_json(Method::GET, "/networks", None, "list networks")
            .await
    }

    async fn create_network(&self, name: &str) -> DockerResult<()> {
        validate_container_id_or_name(name)?;
        let body = CreateNetworkBody {
            name: name.to_string(),
            driver: "bridge".to_string(),
        };
        let response = self
            .send_json(Method::POST, "/networks/create", &body, "create network")
            .await?;
        let status = response.status();
        let bytes = collect_body(response, "create network").await?;
        check_status(status, &bytes, "create network")
    }

    async fn image_exists(&self, image: &str) -> DockerResult<bool> {
        validate_image_name(image)?;
        let path = format!("/images/{}/json", image);
        match self.call(Method::GET, &path, None, "inspect image").await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn pull_image(&self, image: &str) -> DockerResult<()> {
        validate_image_name(image)?;
        let path = format!("/images/create?fromImage={}", urlencoding::encode(image));
        // The pull only finishes once the progress stream is fully read.
        let bytes = self.call(Method::POST, &path, None, "pull image").await?;
        match pull_error(&bytes) {
            Some(message) => Err(DockerError::Api {
                operation: "pull image",
                status: 200,
                message,
            }),
            None => Ok(()),
        }
    }
}
