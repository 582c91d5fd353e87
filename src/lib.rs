//! Bellwether - reacts to changes in an append-only issue log.
//!
//! This library provides the core functionality for the `bw` CLI tool:
//! reading the issue log into snapshots, diffing snapshots, ready/blocked
//! classification, the live watcher, the execution ledger, and handler dispatch.

pub mod cli;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod diff;
pub mod dispatch;
pub mod ledger;
pub mod models;
pub mod scheduler;
pub mod storage;
pub mod watcher;

use std::path::PathBuf;

/// Test utilities for isolated test environments.
#[cfg(test)]
pub(crate) mod test_utils {
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    use crate::models::{Issue, IssueStatus};
    use crate::storage::{ISSUES_FILE, STORAGE_DIR_NAME, Storage};

    /// A temporary project with an empty `.bellwether/issues.jsonl`.
    pub struct TestEnv {
        pub project_dir: TempDir,
    }

    impl TestEnv {
        pub fn new() -> Self {
            let project_dir = TempDir::new().unwrap();
            let storage_dir = project_dir.path().join(STORAGE_DIR_NAME);
            fs::create_dir_all(&storage_dir).unwrap();
            fs::File::create(storage_dir.join(ISSUES_FILE)).unwrap();
            Self { project_dir }
        }

        /// Get the path to the project root.
        pub fn path(&self) -> &Path {
            self.project_dir.path()
        }

        /// Get the path to the `.bellwether/` directory.
        pub fn storage_path(&self) -> PathBuf {
            self.path().join(STORAGE_DIR_NAME)
        }

        pub fn storage(&self) -> Storage {
            Storage::open(self.path()).unwrap()
        }

        /// Append one issue revision to the log.
        pub fn append(&self, issue: &Issue) {
            self.append_raw(&serde_json::to_string(issue).unwrap());
        }

        /// Append a raw line to the log.
        pub fn append_raw(&self, line: &str) {
            let mut file = OpenOptions::new()
                .append(true)
                .open(self.storage_path().join(ISSUES_FILE))
                .unwrap();
            writeln!(file, "{}", line).unwrap();
        }
    }

    impl Default for TestEnv {
        fn default() -> Self {
            Self::new()
        }
    }

    /// An issue with fixed timestamps so snapshots compare deterministically.
    pub fn issue(id: &str, status: IssueStatus, depends_on: &[&str]) -> Issue {
        let at = chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let mut issue = Issue::new(id, format!("Issue {}", id));
        issue.status = status;
        issue.created_at = at;
        issue.updated_at = at;
        if status.is_closed() {
            issue.closed_at = Some(at);
        }
        issue.depends_on = depends_on.iter().map(|d| d.to_string()).collect();
        issue
    }
}

/// Library-level error type for bellwether operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("No .bellwether directory found at or above {}", .0.display())]
    NotInitialized(PathBuf),

    #[error("Issue log not found: {}", .0.display())]
    LogMissing(PathBuf),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for bellwether operations.
pub type Result<T> = std::result::Result<T, Error>;
