//! Room-scoped file operations and tree synchronisation.

use cloudroom_protocol::FileNode;
use dashmap::DashMap;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::diff::{TreeDiff, diff, is_folder_path};
use super::tree::{build_tree, listing_command, parse_listing};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::exec::CommandExecutor;
use crate::shell::{parent_path, shell_quote, workspace_path};

/// Exit code the guarded create/rename scripts use for "target exists".
const EXIT_PATH_CONFLICT: i64 = 17;

/// Last known tree of one room. `None` means "snapshot before the next diff".
type TreeCache = Arc<Mutex<Option<Vec<FileNode>>>>;

/// Snapshot, diff and sync of room workspaces.
///
/// Every operation that touches a room's workspace holds that room's lock, so two syncs
/// for one room never interleave and the cached tree is only ever replaced whole.
#[derive(Clone)]
pub struct FileTreeService {
    executor: CommandExecutor,
    config: Arc<OrchestratorConfig>,
    caches: Arc<DashMap<String, TreeCache>>,
}

impl FileTreeService {
    pub fn new(executor: CommandExecutor, config: Arc<OrchestratorConfig>) -> Self {
        Self {
            executor,
            config,
            caches: Arc::new(DashMap::new()),
        }
    }

    fn workspace(&self) -> &str {
        &self.config.workspace_dir
    }

    fn container(&self, room_id: &str) -> String {
        self.config.container_name(room_id)
    }

    fn cache(&self, room_id: &str) -> TreeCache {
        self.caches
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn path(&self, path: &str) -> Result<String> {
        workspace_path(self.workspace(), path)
    }

    /// Take a fresh snapshot of a container's workspace.
    pub async fn snapshot(&self, container: &str) -> Result<Vec<FileNode>> {
        let command = listing_command(self.workspace(), &self.config.tree.blacklist);
        let output = self.executor.exec_raw(container, &command).await?;
        let entries = parse_listing(&output, self.workspace());
        Ok(build_tree(
            &entries,
            self.workspace(),
            &self.config.tree.executable_extensions,
        ))
    }

    /// Apply a diff: every delete first, then every create, one command per path.
    ///
    /// Stops at the first failing command; whatever ran before it stays applied.
    pub async fn apply_diff(&self, container: &str, changes: &TreeDiff) -> Result<()> {
        let root = self.path(self.workspace())?;
        let mut deletes = Vec::with_capacity(changes.to_delete.len());
        for raw in &changes.to_delete {
            let path = self.path(raw)?;
            if path == root {
                debug!("not deleting workspace root in {}", container);
                continue;
            }
            deletes.push(path);
        }
        let mut creates = Vec::with_capacity(changes.to_create.len());
        for raw in &changes.to_create {
            creates.push((self.path(raw)?, is_folder_path(raw)));
        }

        for path in deletes {
            self.executor
                .exec(container, &format!("rm -rf -- {}", shell_quote(&path)))
                .await?;
        }
        for (path, folder) in creates {
            let command = if folder {
                format!("mkdir -p -- {}", shell_quote(&path))
            } else {
                format!("touch -- {}", shell_quote(&path))
            };
            self.executor.exec(container, &command).await?;
        }
        Ok(())
    }

    /// Re-snapshot a room and replace its cached tree.
    pub async fn get_file_tree(&self, room_id: &str) -> Result<Vec<FileNode>> {
        let cache = self.cache(room_id);
        let mut last = cache.lock().await;
        let tree = self.snapshot(&self.container(room_id)).await?;
        *last = Some(tree.clone());
        Ok(tree)
    }

    /// Bring a room's workspace structure in line with `desired`.
    ///
    /// Returns the diff that was applied. On failure the cache is dropped so the next sync
    /// starts from a fresh snapshot.
    pub async fn sync(&self, room_id: &str, desired: &[FileNode]) -> Result<TreeDiff> {
        let container = self.container(room_id);
        let cache = self.cache(room_id);
        let mut last = cache.lock().await;

        let current = match last.take() {
            Some(tree) => tree,
            None => self.snapshot(&container).await?,
        };
        let changes = diff(&current, desired);
        if changes.is_empty() {
            *last = Some(current);
            return Ok(changes);
        }

        info!(
            "syncing room {}: {} to create, {} to delete",
            room_id,
            changes.to_create.len(),
            changes.to_delete.len()
        );
        self.apply_diff(&container, &changes).await?;
        *last = Some(self.snapshot(&container).await?);
        Ok(changes)
    }

    /// Drop the cached tree of a room.
    pub async fn invalidate(&self, room_id: &str) {
        let cache = self.cache(room_id);
        *cache.lock().await = None;
    }

    /// Forget everything about a removed room.
    pub fn forget(&self, room_id: &str) {
        self.caches.remove(room_id);
    }

    /// Run a workspace-mutating command under the room lock and drop the cache.
    async fn mutate(&self, room_id: &str, command: &str, conflict: &str) -> Result<()> {
        let container = self.container(room_id);
        let cache = self.cache(room_id);
        let mut last = cache.lock().await;
        *last = None;

        let output = self.executor.run(&container, command).await?;
        match output.exit_code {
            0 => Ok(()),
            EXIT_PATH_CONFLICT => Err(OrchestratorError::PathConflict(conflict.to_string())),
            code => Err(OrchestratorError::CommandFailed {
                command: command.to_string(),
                exit_code: code,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    /// Full content of a file, untrimmed.
    pub async fn read_file(&self, room_id: &str, path: &str) -> Result<String> {
        let path = self.path(path)?;
        self.executor
            .exec_raw(
                &self.container(room_id),
                &format!("cat -- {}", shell_quote(&path)),
            )
            .await
    }

    /// Overwrite a file with `content`.
    pub async fn write_file(&self, room_id: &str, path: &str, content: &str) -> Result<()> {
        let path = self.path(path)?;
        let command = format!(
            "printf '%s' {} > {}",
            shell_quote(content),
            shell_quote(&path)
        );
        self.mutate(room_id, &command, &path).await
    }

    /// Create an empty file. Fails with `PathConflict` if anything exists at `path`.
    pub async fn create_file(&self, room_id: &str, path: &str) -> Result<()> {
        let path = self.path(path)?;
        let quoted = shell_quote(&path);
        let command = format!(
            "[ -e {q} ] || [ -L {q} ] && exit {code}; mkdir -p -- {parent} && touch -- {q}",
            q = quoted,
            code = EXIT_PATH_CONFLICT,
            parent = shell_quote(parent_path(&path)),
        );
        self.mutate(room_id, &command, &path).await
    }

    /// Create a folder and its parents. Fails with `PathConflict` if `path` exists.
    pub async fn create_folder(&self, room_id: &str, path: &str) -> Result<()> {
        let path = self.path(path)?;
        let quoted = shell_quote(&path);
        let command = format!(
            "[ -e {q} ] || [ -L {q} ] && exit {code}; mkdir -p -- {q}",
            q = quoted,
            code = EXIT_PATH_CONFLICT,
        );
        self.mutate(room_id, &command, &path).await
    }

    /// Remove a file or folder recursively. The workspace root itself is refused.
    pub async fn delete_path(&self, room_id: &str, path: &str) -> Result<()> {
        let path = self.path(path)?;
        if path == self.path(self.workspace())? {
            return Err(OrchestratorError::InvalidPath(path));
        }
        let command = format!("rm -rf -- {}", shell_quote(&path));
        self.mutate(room_id, &command, &path).await
    }

    /// Move `from` to `to`. Fails with `PathConflict` if `to` exists.
    pub async fn rename_path(&self, room_id: &str, from: &str, to: &str) -> Result<()> {
        let from = self.path(from)?;
        let to = self.path(to)?;
        let root = self.path(self.workspace())?;
        if from == root || to == root {
            return Err(OrchestratorError::InvalidPath(from));
        }
        let command = format!(
            "[ -e {to} ] || [ -L {to} ] && exit {code}; mkdir -p -- {parent} && mv -- {from} {to}",
            to = shell_quote(&to),
            from = shell_quote(&from),
            code = EXIT_PATH_CONFLICT,
            parent = shell_quote(parent_path(&to)),
        );
        self.mutate(room_id, &command, &to).await
    }
}
