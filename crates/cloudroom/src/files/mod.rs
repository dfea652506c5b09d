//! Workspace file trees: snapshot, diff and sync.

pub mod diff;
mod service;
pub mod tree;

pub use diff::{TreeDiff, diff, flatten};
pub use service::FileTreeService;
pub use tree::{ListingEntry, build_tree, listing_command, parse_listing};
