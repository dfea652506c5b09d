//! File tree snapshot types.

use serde::{Deserialize, Serialize};

/// Kind of a filesystem entry in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Folder,
    Symlink,
    Executable,
}

impl FileType {
    /// Whether this entry can hold children.
    pub fn is_folder(self) -> bool {
        matches!(self, FileType::Folder)
    }
}

/// A node in a workspace file-tree snapshot.
///
/// `id` is assigned while the tree is built and is not stable across snapshots.
/// Folders always carry `children` (possibly empty); other kinds never do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

impl FileNode {
    /// Create a folder node with no children.
    pub fn folder(id: impl Into<String>, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
            kind: FileType::Folder,
            children: Some(Vec::new()),
        }
    }

    /// Create a leaf node of the given kind.
    pub fn leaf(
        id: impl Into<String>,
        name: impl Into<String>,
        path: impl Into<String>,
        kind: FileType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
            kind,
            children: None,
        }
    }

    /// Children of this node, empty for leaves.
    pub fn children(&self) -> &[FileNode] {
        self.children.as_deref().unwrap_or(&[])
    }

    /// Find a descendant (or self) by absolute path.
    pub fn find(&self, path: &str) -> Option<&FileNode> {
        if self.path == path {
            return Some(self);
        }
        self.children().iter().find_map(|child| child.find(path))
    }
}
