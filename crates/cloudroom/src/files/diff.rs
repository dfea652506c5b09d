//! Path-level diff between two tree snapshots.
//!
//! Both trees are flattened to their full path sets. Folder paths carry a trailing `/`
//! so the apply step can tell `mkdir` from `touch`. A rename shows up as a delete plus
//! a create of the whole subtree.

use cloudroom_protocol::FileNode;
use std::collections::HashSet;

/// Create/delete sets turning one tree into another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDiff {
    pub to_create: Vec<String>,
    pub to_delete: Vec<String>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty()
    }
}

/// Whether a flattened path names a folder.
pub fn is_folder_path(path: &str) -> bool {
    path.ends_with('/')
}

/// Pre-order list of every path in the tree, folders suffixed with `/`.
pub fn flatten(tree: &[FileNode]) -> Vec<String> {
    fn walk(node: &FileNode, out: &mut Vec<String>) {
        if node.kind.is_folder() {
            out.push(format!("{}/", node.path.trim_end_matches('/')));
            for child in node.children() {
                walk(child, out);
            }
        } else {
            out.push(node.path.clone());
        }
    }

    let mut out = Vec::new();
    for node in tree {
        walk(node, &mut out);
    }
    out
}

/// Compute what to create and delete so that `old` becomes `new`.
///
/// Both lists keep the pre-order of the tree they come from, so parents precede their
/// children.
pub fn diff(old: &[FileNode], new: &[FileNode]) -> TreeDiff {
    let old_paths = flatten(old);
    let new_paths = flatten(new);
    let old_set: HashSet<&str> = old_paths.iter().map(String::as_str).collect();
    let new_set: HashSet<&str> = new_paths.iter().map(String::as_str).collect();

    TreeDiff {
        to_create: new_paths
            .iter()
            .filter(|p| !old_set.contains(p.as_str()))
            .cloned()
            .collect(),
        to_delete: old_paths
            .iter()
            .filter(|p| !new_set.contains(p.as_str()))
            .cloned()
            .collect(),
    }
}
