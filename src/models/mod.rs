//! Data models for bellwether.
//!
//! This module defines the core data structures:
//! - `Issue` - A unit of work read from the issue log
//! - `IssueStatus` / `IssueKind` - The closed value sets for status and type
//! - `Epic` / `EpicProgress` - An epic with its derived children and completion
//! - [`execution`] - Execution ledger entries
//! - [`graph`] - Ready/blocked classification over a snapshot

pub mod execution;
pub mod graph;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Issue status in the workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Open,
    InProgress,
    Closed,
}

impl IssueStatus {
    /// Parse from the exact log representation. Anything else is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(IssueStatus::Open),
            "in_progress" => Some(IssueStatus::InProgress),
            "closed" => Some(IssueStatus::Closed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Closed => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, IssueStatus::Closed)
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of work an issue represents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    #[default]
    Task,
    Bug,
    Feature,
    Epic,
}

impl IssueKind {
    /// Parse from the exact log representation. Anything else is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task" => Some(IssueKind::Task),
            "bug" => Some(IssueKind::Bug),
            "feature" => Some(IssueKind::Feature),
            "epic" => Some(IssueKind::Epic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Task => "task",
            IssueKind::Bug => "bug",
            IssueKind::Feature => "feature",
            IssueKind::Epic => "epic",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Highest (least urgent) priority value accepted in the log.
pub const MAX_PRIORITY: u8 = 4;

/// A work item tracked in the issue log.
///
/// The inverse `blocks` relation is not stored here; it is derived per
/// snapshot by [`crate::storage::Snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Unique identifier (e.g., "bw-1")
    pub id: String,

    /// Issue title
    pub title: String,

    /// Detailed description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Current status
    pub status: IssueStatus,

    /// Issue type
    #[serde(rename = "type")]
    pub kind: IssueKind,

    /// Priority level (0-4, lower is more urgent)
    pub priority: u8,

    /// Assigned user or agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    /// Labels for categorization
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Closure timestamp, present when status is closed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,

    /// Issue IDs this issue is blocked by
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
}

impl Issue {
    /// Create a new open task with the given ID and title.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            status: IssueStatus::Open,
            kind: IssueKind::Task,
            priority: 2,
            assignee: None,
            labels: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            closed_at: None,
            depends_on: BTreeSet::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    pub fn is_epic(&self) -> bool {
        self.kind == IssueKind::Epic
    }

    /// Validate one log line and build an issue from it.
    ///
    /// Every required field is checked explicitly; status, type and priority
    /// must fall inside their closed value sets. Values are never coerced.
    pub fn parse_line(line: &str) -> Result<Issue, IssueParseError> {
        let value: Value = serde_json::from_str(line)?;
        let obj = value.as_object().ok_or(IssueParseError::NotAnObject)?;

        let id = required_str(obj, "id")?;
        let title = required_str(obj, "title")?;

        let status_raw = required_str(obj, "status")?;
        let status = IssueStatus::parse(&status_raw)
            .ok_or(IssueParseError::InvalidStatus(status_raw))?;

        let kind_raw = required_str(obj, "type")?;
        let kind = IssueKind::parse(&kind_raw).ok_or(IssueParseError::InvalidKind(kind_raw))?;

        let priority = match obj.get("priority") {
            None | Some(Value::Null) => return Err(IssueParseError::MissingField("priority")),
            Some(v) => v.as_i64().ok_or(IssueParseError::InvalidField {
                field: "priority",
                reason: "expected an integer",
            })?,
        };
        if !(0..=MAX_PRIORITY as i64).contains(&priority) {
            return Err(IssueParseError::PriorityOutOfRange(priority));
        }

        let created_at = required_timestamp(obj, "created_at")?;
        let updated_at = required_timestamp(obj, "updated_at")?;
        let closed_at = match optional_str(obj, "closed_at")? {
            Some(raw) => Some(parse_timestamp("closed_at", &raw)?),
            None => None,
        };

        Ok(Issue {
            id,
            title,
            description: optional_str(obj, "description")?,
            status,
            kind,
            priority: priority as u8,
            assignee: optional_str(obj, "assignee")?,
            labels: string_set(obj, "labels")?,
            created_at,
            updated_at,
            closed_at,
            depends_on: string_set(obj, "depends_on")?,
        })
    }
}

/// Why a log line could not be turned into an [`Issue`].
#[derive(Debug, thiserror::Error)]
pub enum IssueParseError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line is not a JSON object")]
    NotAnObject,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("invalid type: {0}")]
    InvalidKind(String),

    #[error("priority out of range 0-4: {0}")]
    PriorityOutOfRange(i64),

    #[error("invalid timestamp in {field}: {value}")]
    InvalidTimestamp { field: &'static str, value: String },

    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

fn required_str(obj: &Map<String, Value>, field: &'static str) -> Result<String, IssueParseError> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) | Some(Value::Null) | None => {
            Err(IssueParseError::MissingField(field))
        }
        Some(_) => Err(IssueParseError::InvalidField {
            field,
            reason: "expected a string",
        }),
    }
}

fn optional_str(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, IssueParseError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(IssueParseError::InvalidField {
            field,
            reason: "expected a string",
        }),
    }
}

fn required_timestamp(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<DateTime<Utc>, IssueParseError> {
    let raw = required_str(obj, field)?;
    parse_timestamp(field, &raw)
}

fn parse_timestamp(field: &'static str, raw: &str) -> Result<DateTime<Utc>, IssueParseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| IssueParseError::InvalidTimestamp {
            field,
            value: raw.to_string(),
        })
}

fn string_set(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<BTreeSet<String>, IssueParseError> {
    let invalid = IssueParseError::InvalidField {
        field,
        reason: "expected an array of strings",
    };
    match obj.get(field) {
        None | Some(Value::Null) => Ok(BTreeSet::new()),
        Some(Value::Array(items)) => {
            let mut set = BTreeSet::new();
            for item in items {
                match item {
                    Value::String(s) => {
                        set.insert(s.clone());
                    }
                    _ => return Err(invalid),
                }
            }
            Ok(set)
        }
        Some(_) => Err(invalid),
    }
}

/// Progress statistics for an epic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpicProgress {
    /// Total number of children
    pub total: usize,
    /// Number of closed children
    pub closed: usize,
    /// Completion percentage (0-100)
    pub percentage: f64,
}

impl EpicProgress {
    pub fn new(total: usize, closed: usize) -> Self {
        let percentage = if total > 0 {
            (closed as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        Self {
            total,
            closed,
            percentage,
        }
    }
}

/// An epic together with its derived children.
#[derive(Debug, Clone, Serialize)]
pub struct Epic {
    #[serde(flatten)]
    pub issue: Issue,
    /// Non-epic issues whose `depends_on` names this epic
    pub children: Vec<String>,
    pub progress: EpicProgress,
}
