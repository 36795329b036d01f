//! # Structure Snapshot
//!
//! The authoritative nested view of the working repository. Directories are
//! JSON objects, files are `null` leaves, so the wire format matches what
//! the operator UI renders.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One entry in the tree: a nested directory or a file leaf.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Node {
    Dir(BTreeMap<String, Node>),
    /// Serializes to JSON `null`
    File,
}

/// The project structure snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct FileTree(pub BTreeMap<String, Node>);

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Insert a file by slash-separated path, creating directories on the way.
    pub fn insert_file(&mut self, path: &str) {
        let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
        let mut cursor = &mut self.0;
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                cursor.insert(segment.to_string(), Node::File);
                return;
            }
            let entry = cursor
                .entry(segment.to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            match entry {
                Node::Dir(children) => cursor = children,
                Node::File => {
                    // A file is being shadowed by a directory; the directory wins.
                    *entry = Node::Dir(BTreeMap::new());
                    let Node::Dir(children) = entry else {
                        unreachable!()
                    };
                    cursor = children;
                }
            }
        }
    }

    /// All file paths in the tree, sorted, slash-separated.
    pub fn files(&self) -> Vec<String> {
        fn walk(node: &BTreeMap<String, Node>, prefix: &str, out: &mut Vec<String>) {
            for (name, child) in node {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                };
                match child {
                    Node::File => out.push(path),
                    Node::Dir(children) => walk(children, &path, out),
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.0, "", &mut out);
        out
    }

    /// Whether `path` exists as a file leaf.
    pub fn contains_file(&self, path: &str) -> bool {
        let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
        let mut cursor = &self.0;
        while let Some(segment) = segments.next() {
            match cursor.get(segment) {
                Some(Node::File) => return segments.peek().is_none(),
                Some(Node::Dir(children)) => cursor = children,
                None => return false,
            }
        }
        false
    }

    /// Build a tree from a list of file paths.
    pub fn from_files<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tree = Self::new();
        for path in paths {
            tree.insert_file(path.as_ref());
        }
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_files_are_null_leaves() {
        let tree = FileTree::from_files(["src/main.py", "README.md"]);
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json["README.md"], serde_json::Value::Null);
        assert_eq!(json["src"]["main.py"], serde_json::Value::Null);
    }

    #[test]
    fn test_round_trip() {
        let tree = FileTree::from_files(["a.py", "pkg/b.py", "pkg/sub/c.py"]);
        let json = serde_json::to_string(&tree).unwrap();
        let back: FileTree = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn test_file_listing_is_sorted() {
        let tree = FileTree::from_files(["z.py", "a/b.py", "a/a.py"]);
        assert_eq!(tree.files(), vec!["a/a.py", "a/b.py", "z.py"]);
    }

    #[test]
    fn test_contains_file() {
        let tree = FileTree::from_files(["src/lib.rs"]);
        assert!(tree.contains_file("src/lib.rs"));
        assert!(!tree.contains_file("src"));
        assert!(!tree.contains_file("src/other.rs"));
    }

    #[test]
    fn test_parse_ui_shape() {
        let tree: FileTree =
            serde_json::from_str(r#"{"add.py": null, "docs": {"add.md": null}}"#).unwrap();
        assert_eq!(tree.files(), vec!["add.py", "docs/add.md"]);
    }
}
