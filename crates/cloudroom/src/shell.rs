//! Shell quoting and workspace path confinement.
//!
//! Every user-controlled string that ends up in an in-container command goes through
//! [`shell_quote`]. Nothing else in the crate builds quoted arguments by hand.

use crate::error::{OrchestratorError, Result};

/// Quote a string so `/bin/sh` treats it as one literal word.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Normalise a user path to an absolute path inside `workspace`.
///
/// Relative paths are resolved against the workspace. `.` segments and duplicate or
/// trailing slashes are dropped. `..` segments, NUL bytes and absolute paths outside the
/// workspace are rejected.
pub fn workspace_path(workspace: &str, path: &str) -> Result<String> {
    if path.contains('\0') {
        return Err(OrchestratorError::InvalidPath(path.replace('\0', "\\0")));
    }
    let root = workspace.trim_end_matches('/');
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", root, path)
    };

    let mut segments = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(OrchestratorError::InvalidPath(path.to_string())),
            other => segments.push(other),
        }
    }
    let normalised = format!("/{}", segments.join("/"));

    if normalised == root || normalised.starts_with(&format!("{}/", root)) {
        Ok(normalised)
    } else {
        Err(OrchestratorError::InvalidPath(path.to_string()))
    }
}

/// Parent directory of an absolute path (`/` for top-level entries).
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last segment of an absolute path.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
