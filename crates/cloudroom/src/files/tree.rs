//! Workspace listing and tree construction.

use cloudroom_protocol::{FileNode, FileType};
use std::collections::HashMap;

use crate::shell::{base_name, parent_path, shell_quote};

/// One parsed line of the listing command.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingEntry {
    pub kind: FileType,
    pub path: String,
    pub size: Option<u64>,
    pub modified: Option<f64>,
}

/// Build the single recursive listing command for `workspace`.
///
/// Blacklisted directory names are pruned by `find` itself so their contents never
/// cross the exec stream. Output lines are `type|path|size|mtime`.
pub fn listing_command(workspace: &str, blacklist: &[String]) -> String {
    let root = shell_quote(workspace);
    if blacklist.is_empty() {
        return format!("find {} -printf '%y|%p|%s|%T@\\n'", root);
    }
    let pruned = blacklist
        .iter()
        .map(|name| format!("-name {}", shell_quote(name)))
        .collect::<Vec<_>>()
        .join(" -o ");
    format!(
        "find {} \\( {} \\) -prune -o -printf '%y|%p|%s|%T@\\n'",
        root, pruned
    )
}

fn kind_from_type_char(raw: &str) -> Option<FileType> {
    match raw {
        "d" => Some(FileType::Folder),
        "l" => Some(FileType::Symlink),
        // Regular files, and fifos/sockets/devices which the tree shows as files.
        "f" | "p" | "s" | "c" | "b" => Some(FileType::File),
        _ => None,
    }
}

fn is_number_or_empty<T: std::str::FromStr>(s: &str) -> bool {
    s.is_empty() || s.parse::<T>().is_ok()
}

/// Parse one listing line. Paths containing `|` are kept intact.
pub fn parse_line(line: &str) -> Option<ListingEntry> {
    let (raw_kind, rest) = line.split_once('|')?;
    let kind = kind_from_type_char(raw_kind)?;

    let mut tail = rest.rsplitn(3, '|');
    let last = tail.next()?;
    let middle = tail.next();
    let head = tail.next();

    let (path, size, modified) = match (head, middle) {
        (Some(path), Some(size))
            if is_number_or_empty::<u64>(size) && is_number_or_empty::<f64>(last) =>
        {
            (path, size.parse().ok(), last.parse().ok())
        }
        (_, Some(_)) if is_number_or_empty::<u64>(last) => {
            let path = rest.rsplit_once('|').map(|(p, _)| p).unwrap_or(rest);
            (path, last.parse().ok(), None)
        }
        _ => (rest, None, None),
    };

    if path.is_empty() || path.chars().any(char::is_control) {
        return None;
    }
    Some(ListingEntry {
        kind,
        path: path.to_string(),
        size,
        modified,
    })
}

/// Parse the listing output, keeping only entries under `workspace`.
pub fn parse_listing(output: &str, workspace: &str) -> Vec<ListingEntry> {
    let root = workspace.trim_end_matches('/');
    let prefix = format!("{}/", root);
    output
        .lines()
        .filter_map(parse_line)
        .map(|mut entry| {
            if entry.path.len() > 1 {
                entry.path = entry.path.trim_end_matches('/').to_string();
            }
            entry
        })
        .filter(|entry| entry.path == root || entry.path.starts_with(&prefix))
        .collect()
}

struct Slot {
    name: String,
    path: String,
    kind: FileType,
    children: Vec<usize>,
}

/// Arena used while the tree is assembled.
struct Builder {
    slots: Vec<Slot>,
    by_path: HashMap<String, usize>,
}

impl Builder {
    fn new(root: &str) -> Self {
        let mut builder = Self {
            slots: Vec::new(),
            by_path: HashMap::new(),
        };
        builder.slots.push(Slot {
            name: base_name(root).to_string(),
            path: root.to_string(),
            kind: FileType::Folder,
            children: Vec::new(),
        });
        builder.by_path.insert(root.to_string(), 0);
        builder
    }

    /// Index of the folder at `path`, creating it and any missing ancestors.
    fn folder(&mut self, path: &str) -> usize {
        if let Some(&idx) = self.by_path.get(path) {
            return idx;
        }
        let parent = self.folder(parent_path(path));
        self.attach(parent, path, FileType::Folder)
    }

    fn attach(&mut self, parent: usize, path: &str, kind: FileType) -> usize {
        let idx = self.slots.len();
        self.slots.push(Slot {
            name: base_name(path).to_string(),
            path: path.to_string(),
            kind,
            children: Vec::new(),
        });
        self.by_path.insert(path.to_string(), idx);
        self.slots[parent].children.push(idx);
        idx
    }

    fn insert(&mut self, path: &str, kind: FileType) {
        if let Some(&idx) = self.by_path.get(path) {
            // A synthetic ancestor may already stand in for a listed folder.
            if self.slots[idx].children.is_empty() {
                self.slots[idx].kind = kind;
            }
            return;
        }
        let parent = self.folder(parent_path(path));
        self.attach(parent, path, kind);
    }

    fn to_node(&self, idx: usize, next_id: &mut u64) -> FileNode {
        let slot = &self.slots[idx];
        *next_id += 1;
        let id = next_id.to_string();
        if !slot.kind.is_folder() {
            return FileNode::leaf(id, &slot.name, &slot.path, slot.kind);
        }

        let mut order = slot.children.clone();
        order.sort_by(|&a, &b| {
            let (a, b) = (&self.slots[a], &self.slots[b]);
            b.kind
                .is_folder()
                .cmp(&a.kind.is_folder())
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
                .then_with(|| a.name.cmp(&b.name))
        });

        let mut node = FileNode::folder(id, &slot.name, &slot.path);
        node.children = Some(
            order
                .into_iter()
                .map(|child| self.to_node(child, next_id))
                .collect(),
        );
        node
    }
}

fn reclassify(kind: FileType, path: &str, executable_extensions: &[String]) -> FileType {
    if kind != FileType::File {
        return kind;
    }
    let name = base_name(path);
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && executable_extensions
                    .iter()
                    .any(|e| e.eq_ignore_ascii_case(ext)) =>
        {
            FileType::Executable
        }
        _ => kind,
    }
}

/// Assemble listing entries into a tree with a single workspace root.
///
/// Missing ancestors are synthesised as folders, so the tree is connected even when
/// intermediate directories were pruned. Returns an empty list when there are no entries.
pub fn build_tree(
    entries: &[ListingEntry],
    workspace: &str,
    executable_extensions: &[String],
) -> Vec<FileNode> {
    if entries.is_empty() {
        return Vec::new();
    }
    let root = workspace.trim_end_matches('/');
    let mut builder = Builder::new(root);
    for entry in entries {
        if entry.path == root {
            continue;
        }
        let kind = reclassify(entry.kind, &entry.path, executable_extensions);
        builder.insert(&entry.path, kind);
    }
    let mut next_id = 0;
    vec![builder.to_node(0, &mut next_id)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeConfig;

    fn exts() -> Vec<String> {
        TreeConfig::default().executable_extensions
    }

    fn tree_from(listing: &str) -> Vec<FileNode> {
        build_tree(&parse_listing(listing, "/workspace"), "/workspace", &exts())
    }

    #[test]
    fn builds_sorted_tree_from_short_lines() {
        let tree = tree_from(
            "d|/workspace|\nf|/workspace/a.txt|\nd|/workspace/sub|\nf|/workspace/sub/b.sh|\n",
        );
        assert_eq!(tree.len(), 1);
        let root = &tree[0];
        assert_eq!(root.name, "workspace");
        assert_eq!(root.kind, FileType::Folder);

        let children = root.children();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].name, "sub");
        assert_eq!(children[0].kind, FileType::Folder);
        assert_eq!(children[0].children()[0].name, "b.sh");
        assert_eq!(children[0].children()[0].kind, FileType::Executable);
        assert_eq!(children[0].children()[0].path, "/workspace/sub/b.sh");
        assert_eq!(children[1].name, "a.txt");
        assert_eq!(children[1].kind, FileType::File);
    }

    #[test]
    fn parses_full_find_output() {
        let entry = parse_line("f|/workspace/a|b.txt|42|1700000000.5").unwrap();
        assert_eq!(entry.path, "/workspace/a|b.txt");
        assert_eq!(entry.size, Some(42));
        assert_eq!(entry.modified, Some(1700000000.5));

        let link = parse_line("l|/workspace/current|7|1700000000.0000000000").unwrap();
        assert_eq!(link.kind, FileType::Symlink);
        assert!(parse_line("x|/workspace/a|1|1").is_none());
        assert!(parse_line("garbage").is_none());
    }

    #[test]
    fn synthesises_missing_ancestors() {
        let tree = tree_from("f|/workspace/deep/er/file.py|10|1.0\n");
        let root = &tree[0];
        let deep = &root.children()[0];
        assert_eq!(deep.path, "/workspace/deep");
        assert_eq!(deep.kind, FileType::Folder);
        let er = &deep.children()[0];
        assert_eq!(er.path, "/workspace/deep/er");
        assert_eq!(er.children()[0].name, "file.py");
    }

    #[test]
    fn sorts_case_insensitively_with_folders_first() {
        let tree = tree_from(
            "f|/workspace/b.txt|\nf|/workspace/A.txt|\nd|/workspace/zeta|\nd|/workspace/Alpha|\n",
        );
        let names: Vec<_> = tree[0].children().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["Alpha", "zeta", "A.txt", "b.txt"]);
    }

    #[test]
    fn ignores_entries_outside_workspace_and_empty_input() {
        assert!(tree_from("").is_empty());
        let tree = tree_from("d|/workspace|\nf|/etc/passwd|\nf|/workspacex/a|\n");
        assert!(tree[0].children().is_empty());
    }

    #[test]
    fn dotfiles_are_not_executables() {
        let tree = tree_from("f|/workspace/.sh|\nf|/workspace/RUN.SH|\n");
        let kinds: Vec<_> = tree[0].children().iter().map(|n| (n.name.as_str(), n.kind)).collect();
        assert!(kinds.contains(&(".sh", FileType::File)));
        assert!(kinds.contains(&("RUN.SH", FileType::Executable)));
    }

    #[test]
    fn ids_are_unique() {
        let tree = tree_from("d|/workspace/a|\nf|/workspace/a/x|\nf|/workspace/y|\n");
        let mut ids = Vec::new();
        fn walk(node: &FileNode, ids: &mut Vec<String>) {
            ids.push(node.id.clone());
            node.children().iter().for_each(|c| walk(c, ids));
        }
        walk(&tree[0], &mut ids);
        let count = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), count);
    }

    #[test]
    fn listing_command_prunes_blacklist() {
        let cmd = listing_command("/workspace", &["node_modules".into(), ".git".into()]);
        assert_eq!(
            cmd,
            "find /workspace \\( -name node_modules -o -name .git \\) -prune -o -printf '%y|%p|%s|%T@\\n'"
        );
    }
}
