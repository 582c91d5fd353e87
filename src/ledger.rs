//! Execution ledger for handler invocations.
//!
//! Every handler invocation attempt is appended to `executions.jsonl` as one
//! JSON line. Entries are never rewritten or removed. The file is shared by the
//! live watcher and batch runs, so every query re-reads it from disk.

use crate::models::execution::{
    ExecutionRecord, ExecutionStatus, LedgerFilter, NewExecution, RetryInfo,
};
use crate::storage::Storage;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Append-only store of execution records.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    /// Ledger backed by the given file. The file is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The ledger of a project's storage directory.
    pub fn open(storage: &Storage) -> Self {
        Self::new(storage.ledger_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry stamped with the current time.
    pub fn record(&self, entry: NewExecution) -> Result<ExecutionRecord> {
        let record = entry.into_record(Utc::now());
        write_record(&self.path, &record)?;
        debug!(
            id = %record.id,
            issue = record.issue_id.as_deref().unwrap_or("-"),
            event = record.event.as_deref().unwrap_or("-"),
            status = %record.status,
            "recorded execution"
        );
        Ok(record)
    }

    /// All entries in append order. A ledger that was never written is empty.
    pub fn entries(&self) -> Result<Vec<ExecutionRecord>> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut records = Vec::new();
        for (index, raw) in content.split(|b| *b == b'\n').enumerate() {
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<ExecutionRecord>(raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = index + 1, error = %e, "skipping unreadable ledger line"),
            }
        }
        Ok(records)
    }

    /// True if any successful entry exists for the issue and event.
    ///
    /// Later failures never undo an earlier success.
    pub fn was_executed(&self, issue_id: &str, event: &str) -> Result<bool> {
        Ok(self
            .entries()?
            .iter()
            .any(|r| r.is_success() && r.is_for(issue_id, event)))
    }

    /// Like [`Ledger::was_executed`], but only counts successes recorded
    /// against the given issue `updated_at`.
    pub fn was_executed_at(
        &self,
        issue_id: &str,
        event: &str,
        issue_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.entries()?.iter().any(|r| {
            r.is_success()
                && r.is_for(issue_id, event)
                && r.issue_updated_at == Some(issue_updated_at)
        }))
    }

    /// Entries matching the filter, oldest first.
    pub fn list(&self, filter: &LedgerFilter) -> Result<Vec<ExecutionRecord>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect())
    }

    pub fn list_failed(&self) -> Result<Vec<ExecutionRecord>> {
        self.list(&LedgerFilter::new().with_status(ExecutionStatus::Failed))
    }

    /// Handler and error of the most recent failed entry for the issue and event.
    ///
    /// This only looks the information up; re-invoking is up to the caller.
    pub fn retry(&self, issue_id: &str, event: &str) -> Result<Option<RetryInfo>> {
        Ok(self
            .entries()?
            .into_iter()
            .rev()
            .find(|r| !r.is_success() && r.is_for(issue_id, event))
            .map(|r| RetryInfo {
                handler: r.handler,
                error: r.error,
                execution_id: r.id,
                failed_at: r.timestamp,
            }))
    }
}

/// Append one record as a single line.
fn write_record(path: &Path, record: &ExecutionRecord) -> Result<()> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;

    Ok(())
}
