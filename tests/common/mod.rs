//! Common test utilities for bellwether integration tests.
//!
//! Provides `TestEnv` for isolated test environments that never read the
//! user's `~/.config/bellwether/config.kdl`.

#![allow(dead_code)]

use assert_cmd::Command;
use serde_json::{Value, json};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
pub use tempfile::TempDir;

/// A test environment with an isolated project and config directory.
///
/// Each `TestEnv` creates two temporary directories:
/// - `project_dir`: Holds `.bellwether/issues.jsonl`
/// - `config_dir`: Stands in for the system config (via `BW_CONFIG_DIR`)
///
/// The `bw()` method returns a `Command` that sets `BW_CONFIG_DIR`
/// per-invocation, making tests parallel-safe.
pub struct TestEnv {
    pub project_dir: TempDir,
    pub config_dir: TempDir,
}

impl TestEnv {
    /// Create a project with an empty issue log.
    pub fn new() -> Self {
        let env = Self {
            project_dir: TempDir::new().unwrap(),
            config_dir: TempDir::new().unwrap(),
        };
        fs::create_dir_all(env.storage_path()).unwrap();
        fs::File::create(env.issues_path()).unwrap();
        env
    }

    /// Get a Command for the bw binary running in the project directory.
    pub fn bw(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_bw"));
        cmd.current_dir(self.path());
        cmd.env("BW_CONFIG_DIR", self.config_dir.path());
        cmd.env_remove("BW_REPO");
        cmd.env_remove("BW_HANDLERS_DIR");
        cmd.env_remove("BW_LOG");
        cmd
    }

    /// Get the path to the project directory.
    pub fn path(&self) -> &Path {
        self.project_dir.path()
    }

    pub fn storage_path(&self) -> PathBuf {
        self.path().join(".bellwether")
    }

    pub fn issues_path(&self) -> PathBuf {
        self.storage_path().join("issues.jsonl")
    }

    pub fn handlers_path(&self) -> PathBuf {
        self.storage_path().join("handlers")
    }

    /// Append one issue line to the log.
    pub fn append(&self, issue: &Value) {
        self.append_raw(&issue.to_string());
    }

    /// Append a raw line to the log.
    pub fn append_raw(&self, line: &str) {
        self.append_bytes(line.as_bytes());
    }

    /// Append a line of arbitrary bytes to the log.
    pub fn append_bytes(&self, line: &[u8]) {
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.issues_path())
            .unwrap();
        file.write_all(line).unwrap();
        file.write_all(b"\n").unwrap();
    }

    /// Write the project's config.kdl.
    pub fn write_config(&self, kdl: &str) {
        fs::write(self.storage_path().join("config.kdl"), kdl).unwrap();
    }

    /// Install an executable shell handler under `.bellwether/handlers/`.
    #[cfg(unix)]
    pub fn handler(&self, name: &str, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        fs::create_dir_all(self.handlers_path()).unwrap();
        let path = self.handlers_path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Run a bw command and parse its stdout as JSON.
    pub fn json(&self, args: &[&str]) -> Value {
        let output = self.bw().args(args).output().unwrap();
        assert!(
            output.status.success(),
            "bw {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// An issue line with fixed timestamps.
pub fn issue(id: &str, status: &str, depends_on: &[&str]) -> Value {
    let mut value = json!({
        "id": id,
        "title": format!("Issue {}", id),
        "status": status,
        "type": "task",
        "priority": 2,
        "created_at": "2026-01-01T00:00:00Z",
        "updated_at": "2026-01-01T00:00:00Z",
        "depends_on": depends_on,
    });
    if status == "closed" {
        value["closed_at"] = json!("2026-01-01T00:00:00Z");
    }
    value
}

/// The same issue at a later `updated_at`.
pub fn revised(mut issue: Value, updated_at: &str) -> Value {
    issue["updated_at"] = json!(updated_at);
    if issue["status"] == "closed" {
        issue["closed_at"] = json!(updated_at);
    }
    issue
}
