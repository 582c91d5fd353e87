//! Storage layer for bellwether.
//!
//! All state lives in a `.bellwether/` directory at the project root:
//!
//! - `issues.jsonl` - the append-only issue log (written by external tools, never by us)
//! - `executions.jsonl` - the execution ledger
//! - `config.kdl` - project configuration
//! - `handlers/` - executable event handlers
//!
//! The directory is located by walking upward from a starting path. It is
//! never created implicitly.

pub mod snapshot;

pub use snapshot::{IssueView, Snapshot};

use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Name of the per-project storage directory.
pub const STORAGE_DIR_NAME: &str = ".bellwether";
/// Issue log file name.
pub const ISSUES_FILE: &str = "issues.jsonl";
/// Execution ledger file name.
pub const LEDGER_FILE: &str = "executions.jsonl";
/// Project configuration file name.
pub const CONFIG_FILE: &str = "config.kdl";

/// Paths of one project's `.bellwether/` directory.
#[derive(Debug, Clone)]
pub struct Storage {
    /// The `.bellwether/` directory itself
    root: PathBuf,
    /// The directory containing `.bellwether/`
    project_root: PathBuf,
}

impl Storage {
    /// Find the storage directory by walking upward from `start`.
    pub fn open(start: &Path) -> Result<Self> {
        let root = find_storage_dir(start)?;
        let project_root = root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.clone());
        Ok(Self { root, project_root })
    }

    /// Check if a storage directory exists at or above `start`.
    pub fn exists(start: &Path) -> bool {
        find_storage_dir(start).is_ok()
    }

    /// The `.bellwether/` directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The project root that contains `.bellwether/`.
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn issues_path(&self) -> PathBuf {
        self.root.join(ISSUES_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Read the issue log into a snapshot stamped with the current revision marker.
    ///
    /// A missing log file is an error, not an empty snapshot.
    pub fn load_snapshot(&self) -> Result<Snapshot> {
        let content = read_log(&self.issues_path())?;
        let revision = revision_marker(&self.project_root, &content);
        Ok(Snapshot::parse(&content).with_revision(revision))
    }

    /// Read the issue log as it was at a git revision.
    ///
    /// Returns an empty snapshot if the log did not exist at that revision.
    pub fn load_snapshot_at(&self, rev: &str) -> Result<Snapshot> {
        let verify = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("{}^{{commit}}", rev))
            .current_dir(&self.project_root)
            .output()?;
        if !verify.status.success() {
            return Err(Error::InvalidInput(format!("Unknown git revision: {}", rev)));
        }
        let commit = String::from_utf8_lossy(&verify.stdout).trim().to_string();

        let show = Command::new("git")
            .arg("show")
            .arg(format!("{}:./{}/{}", commit, STORAGE_DIR_NAME, ISSUES_FILE))
            .current_dir(&self.project_root)
            .output()?;
        if !show.status.success() {
            debug!(rev = %rev, "issue log absent at revision, using empty snapshot");
            return Ok(Snapshot::empty().with_revision(commit));
        }

        Ok(Snapshot::parse(&show.stdout).with_revision(commit))
    }
}

/// Read a log file as raw bytes, mapping "not found" to [`Error::LogMissing`].
///
/// Lines are decoded individually by [`Snapshot::parse`], so one line of
/// invalid UTF-8 never fails the whole read.
pub fn read_log(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::LogMissing(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Read any issue log file (e.g., an exported copy) into a snapshot.
pub fn load_snapshot_file(path: &Path) -> Result<Snapshot> {
    let content = read_log(path)?;
    let revision = content_hash_marker(&content);
    Ok(Snapshot::parse(&content).with_revision(revision))
}

/// Walk upward from `start` until a `.bellwether/` directory is found.
pub fn find_storage_dir(start: &Path) -> Result<PathBuf> {
    let start = start
        .canonicalize()
        .map_err(|_| Error::NotInitialized(start.to_path_buf()))?;

    for dir in start.ancestors() {
        let candidate = dir.join(STORAGE_DIR_NAME);
        if candidate.is_dir() {
            return Ok(candidate);
        }
    }

    Err(Error::NotInitialized(start))
}

/// Revision marker for the log: the git HEAD commit when the project is a git
/// work tree, otherwise a hash of the log content.
pub fn revision_marker(project_root: &Path, content: &[u8]) -> String {
    git_head(project_root).unwrap_or_else(|| content_hash_marker(content))
}

fn git_head(project_root: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(project_root)
        .output()
        .ok()?;

    if output.status.success() {
        let hash = String::from_utf8(output.stdout).ok()?;
        Some(hash.trim().to_string())
    } else {
        None
    }
}

/// `sha256:<12 hex chars>` of the given content.
pub fn content_hash_marker(content: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_ref());
    let hash_hex = format!("{:x}", hasher.finalize());
    format!("sha256:{}", &hash_hex[..12])
}
