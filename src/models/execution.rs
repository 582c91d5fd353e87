//! Execution ledger entries.
//!
//! One `ExecutionRecord` is written per handler invocation attempt. Records
//! are immutable: a retry produces a new record instead of amending the old one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What caused a handler to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    /// An issue change detected in the log
    Issue,
    /// A registered schedule fired
    Schedule,
    /// An operator asked for it explicitly
    Manual,
}

impl ExecutionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "issue" => Some(ExecutionType::Issue),
            "schedule" => Some(ExecutionType::Schedule),
            "manual" => Some(ExecutionType::Manual),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::Issue => "issue",
            ExecutionType::Schedule => "schedule",
            ExecutionType::Manual => "manual",
        }
    }
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "success" | "succeeded" => Some(ExecutionStatus::Success),
            "failed" | "failure" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which entry point started the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// The long-running watcher
    Watch,
    /// A single batch pass (`bw run`)
    Run,
    /// `bw retry`
    Retry,
    /// The interval scheduler
    Schedule,
    /// `bw trigger`
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Watch => "watch",
            Trigger::Run => "run",
            Trigger::Retry => "retry",
            Trigger::Schedule => "schedule",
            Trigger::Manual => "manual",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Unique record identifier
    pub id: Uuid,

    #[serde(rename = "type")]
    pub execution_type: ExecutionType,

    /// Issue the handler ran for (issue and manual executions)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,

    /// Event name (e.g., "created", "ready")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    /// Schedule name (schedule executions)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    pub status: ExecutionStatus,

    /// Identifier of the handler that ran
    pub handler: String,

    pub trigger: Trigger,

    /// Revision marker of the issue log at execution time
    pub revision: String,

    pub duration_ms: u64,

    /// When the record was appended
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// `updated_at` of the issue the handler saw
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_updated_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// True if this record is for the given issue and event.
    pub fn is_for(&self, issue_id: &str, event: &str) -> bool {
        self.issue_id.as_deref() == Some(issue_id) && self.event.as_deref() == Some(event)
    }
}

/// An execution outcome waiting to be appended to the ledger.
///
/// The ledger assigns the record ID and timestamp.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub execution_type: ExecutionType,
    pub issue_id: Option<String>,
    pub event: Option<String>,
    pub schedule: Option<String>,
    pub status: ExecutionStatus,
    pub handler: String,
    pub trigger: Trigger,
    pub revision: String,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub issue_updated_at: Option<DateTime<Utc>>,
}

impl NewExecution {
    /// A successful issue-triggered execution.
    pub fn issue(
        issue_id: impl Into<String>,
        event: impl Into<String>,
        handler: impl Into<String>,
        trigger: Trigger,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            execution_type: ExecutionType::Issue,
            issue_id: Some(issue_id.into()),
            event: Some(event.into()),
            schedule: None,
            status: ExecutionStatus::Success,
            handler: handler.into(),
            trigger,
            revision: revision.into(),
            duration_ms: 0,
            error: None,
            issue_updated_at: None,
        }
    }

    /// A successful schedule-triggered execution.
    pub fn schedule(
        schedule: impl Into<String>,
        handler: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            execution_type: ExecutionType::Schedule,
            issue_id: None,
            event: None,
            schedule: Some(schedule.into()),
            status: ExecutionStatus::Success,
            handler: handler.into(),
            trigger: Trigger::Schedule,
            revision: revision.into(),
            duration_ms: 0,
            error: None,
            issue_updated_at: None,
        }
    }

    pub fn with_type(mut self, execution_type: ExecutionType) -> Self {
        self.execution_type = execution_type;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_issue_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.issue_updated_at = Some(updated_at);
        self
    }

    /// Mark the execution as failed with the given message.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = ExecutionStatus::Failed;
        self.error = Some(error.into());
        self
    }

    pub(crate) fn into_record(self, timestamp: DateTime<Utc>) -> ExecutionRecord {
        ExecutionRecord {
            id: Uuid::new_v4(),
            execution_type: self.execution_type,
            issue_id: self.issue_id,
            event: self.event,
            schedule: self.schedule,
            status: self.status,
            handler: self.handler,
            trigger: self.trigger,
            revision: self.revision,
            duration_ms: self.duration_ms,
            timestamp,
            error: self.error,
            issue_updated_at: self.issue_updated_at,
        }
    }
}

/// Optional narrowing for ledger listings. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub issue_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub execution_type: Option<ExecutionType>,
}

impl LedgerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_issue(mut self, issue_id: impl Into<String>) -> Self {
        self.issue_id = Some(issue_id.into());
        self
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, execution_type: ExecutionType) -> Self {
        self.execution_type = Some(execution_type);
        self
    }

    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        if let Some(ref issue_id) = self.issue_id {
            if record.issue_id.as_deref() != Some(issue_id.as_str()) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(execution_type) = self.execution_type {
            if record.execution_type != execution_type {
                return false;
            }
        }
        true
    }
}

/// Information needed to re-invoke a failed handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryInfo {
    pub handler: String,
    pub error: Option<String>,
    /// The failed record this lookup came from
    pub execution_id: Uuid,
    pub failed_at: DateTime<Utc>,
}
