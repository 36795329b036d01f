//! File tree snapshots and the git-backed repository gateway.

pub mod gateway;
pub mod tree;

pub use gateway::{binary_sentinel, read_content, reset_repo, FileContent, RepoGateway};
pub use tree::{FileTree, Node};
