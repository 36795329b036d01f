//! # Repository Gateway
//!
//! Writes worker output into the working tree and commits it. The gateway is
//! a single-writer resource: only the structurer agent holds one. Read-only
//! helpers (`read_content`) are available to the server for `/file_content`.

use anyhow::{bail, Context, Result};
use git2::{Repository, Signature};
use std::path::{Component, Path, PathBuf};

use super::tree::FileTree;

/// Extensions treated as binary without reading the file.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "tif", "tiff", "mp3", "wav", "ogg", "flac", "mp4",
    "avi", "mov", "mkv", "pdf", "doc", "docx", "xls", "xlsx", "zip", "rar", "7z", "tar", "gz",
    "exe", "dll", "so", "dylib", "db", "sqlite", "pyc", "class", "o", "a", "woff", "woff2", "ttf",
    "otf",
];

/// Result of reading a file through the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Binary,
}

/// The sentinel the push channel and `/file_content` emit for binary files.
pub fn binary_sentinel(path: &str) -> String {
    format!("[Binary file: {path}]")
}

/// Reject paths that escape the repository root.
fn is_safe_path(rel: &str) -> bool {
    if rel.is_empty() {
        return false;
    }
    let path = Path::new(rel);
    !path.is_absolute()
        && path.components().all(|c| {
            matches!(c, Component::Normal(_) | Component::CurDir)
        })
}

/// Git-backed gateway over the working repository.
pub struct RepoGateway {
    root: PathBuf,
    repo: Repository,
}

impl RepoGateway {
    /// Open the repository at `root`, initializing it if needed.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("failed to create repository directory {root:?}"))?;
        let repo = match Repository::open(root) {
            Ok(repo) => repo,
            Err(_) => Repository::init(root)
                .with_context(|| format!("failed to initialize repository at {root:?}"))?,
        };
        Ok(Self {
            root: root.to_path_buf(),
            repo,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `content` to `rel` inside the working tree.
    pub fn write(&self, rel: &str, content: &[u8]) -> Result<()> {
        if !is_safe_path(rel) {
            bail!("unsafe repository path: {rel:?}");
        }
        let full = self.root.join(rel);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory for {rel:?}"))?;
        }
        std::fs::write(&full, content).with_context(|| format!("failed to write {rel:?}"))
    }

    /// Stage everything and commit. A clean tree is not an error.
    pub fn commit(&self, message: &str) -> Result<()> {
        let mut index = self.repo.index()?;
        index.add_all(["*"], git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;

        let parent = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        if let Some(ref parent) = parent {
            if parent.tree_id() == tree_id {
                return Ok(()); // nothing staged
            }
        }

        let sig = Signature::now("conductor", "conductor@localhost")?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        self.repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .context("failed to commit")?;
        Ok(())
    }

    /// Read a file back, detecting binary content.
    pub fn read(&self, rel: &str) -> Result<FileContent> {
        read_content(&self.root, rel)
    }

    /// Enumerate the working tree as a structure snapshot.
    pub fn tree(&self) -> Result<FileTree> {
        let mut tree = FileTree::new();
        walk_dir(&self.root, "", &mut tree)?;
        Ok(tree)
    }

    /// Delete the working tree and re-initialize an empty repository.
    pub fn reset(&mut self) -> Result<()> {
        self.repo = reset_repo(&self.root)?;
        Ok(())
    }
}

fn walk_dir(dir: &Path, prefix: &str, tree: &mut FileTree) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {dir:?}"))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // Hidden entries stay out of the snapshot, except .gitignore
        if name.starts_with('.') && name != ".gitignore" {
            continue;
        }
        let rel = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_dir(&entry.path(), &rel, tree)?;
        } else {
            tree.insert_file(&rel);
        }
    }
    Ok(())
}

/// Read-only variant of [`RepoGateway::read`], usable without opening git.
pub fn read_content(root: &Path, rel: &str) -> Result<FileContent> {
    if !is_safe_path(rel) {
        bail!("unsafe repository path: {rel:?}");
    }
    let full = root.join(rel);
    if !full.is_file() {
        bail!("no such file: {rel:?}");
    }
    let ext = full
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if BINARY_EXTENSIONS.contains(&ext.as_str()) {
        return Ok(FileContent::Binary);
    }
    let bytes = std::fs::read(&full).with_context(|| format!("failed to read {rel:?}"))?;
    match String::from_utf8(bytes) {
        Ok(text) => Ok(FileContent::Text(text)),
        Err(_) => Ok(FileContent::Binary),
    }
}

/// Delete the tree under `root` and re-init a fresh repository there.
pub fn reset_repo(root: &Path) -> Result<Repository> {
    if root.exists() {
        std::fs::remove_dir_all(root)
            .with_context(|| format!("failed to clear repository at {root:?}"))?;
    }
    std::fs::create_dir_all(root)?;
    Repository::init(root).with_context(|| format!("failed to re-init repository at {root:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_commit_and_enumerate() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RepoGateway::open(dir.path()).unwrap();

        gateway.write("add.py", b"def add(a, b):\n    return a + b\n").unwrap();
        gateway.write("docs/add.md", b"# add\n").unwrap();
        gateway.commit("executor: update add.py (subtask t1)").unwrap();

        let tree = gateway.tree().unwrap();
        assert_eq!(tree.files(), vec!["add.py", "docs/add.md"]);
    }

    #[test]
    fn test_commit_on_clean_tree_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RepoGateway::open(dir.path()).unwrap();
        gateway.write("a.txt", b"one").unwrap();
        gateway.commit("first").unwrap();
        gateway.commit("second, nothing changed").unwrap();
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RepoGateway::open(dir.path()).unwrap();
        assert!(gateway.write("../escape.txt", b"x").is_err());
        assert!(gateway.write("/abs.txt", b"x").is_err());
        assert!(gateway.write("", b"x").is_err());
    }

    #[test]
    fn test_binary_detection() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RepoGateway::open(dir.path()).unwrap();
        gateway.write("logo.png", &[0x89, 0x50, 0x4e, 0x47]).unwrap();
        gateway.write("raw.bin", &[0xff, 0xfe, 0x00, 0x01]).unwrap();
        gateway.write("ok.txt", b"text").unwrap();

        assert_eq!(gateway.read("logo.png").unwrap(), FileContent::Binary);
        assert_eq!(gateway.read("raw.bin").unwrap(), FileContent::Binary);
        assert_eq!(
            gateway.read("ok.txt").unwrap(),
            FileContent::Text("text".to_string())
        );
    }

    #[test]
    fn test_reset_clears_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut gateway = RepoGateway::open(dir.path()).unwrap();
        gateway.write("a.txt", b"one").unwrap();
        gateway.commit("first").unwrap();
        gateway.reset().unwrap();
        assert!(gateway.tree().unwrap().is_empty());
    }

    #[test]
    fn test_binary_sentinel_format() {
        assert_eq!(binary_sentinel("img/logo.png"), "[Binary file: img/logo.png]");
    }
}
