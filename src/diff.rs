//! Change detection between two snapshots of the issue log.
//!
//! [`diff`] is a pure function: it compares every issue in `after` with the
//! same ID in `before` and sorts it into created, updated or closed. Issues
//! that disappear from `after` produce nothing.
//!
//! [`detect_events`] builds on it, refining updates into reopened events and
//! adding ready/blocked events for issues whose readiness flipped.

use crate::models::Issue;
use crate::models::graph::{Readiness, ReadinessPolicy, ReadinessState, readiness_flips};
use crate::storage::Snapshot;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which fields count toward "updated".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// Treat a label-set change as an update
    pub labels_count: bool,
}

/// Before and after state of one issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueChange {
    pub before: Issue,
    pub after: Issue,
}

/// Result of diffing two snapshots. Each list is in ID order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub created: Vec<Issue>,
    pub updated: Vec<IssueChange>,
    pub closed: Vec<IssueChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.closed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.closed.len()
    }
}

/// Diff two snapshots with default options.
pub fn diff(before: &Snapshot, after: &Snapshot) -> ChangeSet {
    diff_with(before, after, DiffOptions::default())
}

pub fn diff_with(before: &Snapshot, after: &Snapshot, options: DiffOptions) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for issue in after.issues() {
        let Some(previous) = before.get(&issue.id) else {
            changes.created.push(issue.clone());
            continue;
        };

        if !has_changed(previous, issue, options) {
            continue;
        }

        let change = IssueChange {
            before: previous.clone(),
            after: issue.clone(),
        };
        if !previous.is_closed() && issue.is_closed() {
            changes.closed.push(change);
        } else {
            changes.updated.push(change);
        }
    }

    changes
}

fn has_changed(before: &Issue, after: &Issue, options: DiffOptions) -> bool {
    before.status != after.status
        || before.title != after.title
        || before.priority != after.priority
        || before.assignee != after.assignee
        || before.description != after.description
        || before.updated_at != after.updated_at
        || (options.labels_count && before.labels != after.labels)
}

/// Name of an event a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Closed,
    Reopened,
    Ready,
    Blocked,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Created,
        EventKind::Updated,
        EventKind::Closed,
        EventKind::Reopened,
        EventKind::Ready,
        EventKind::Blocked,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Closed => "closed",
            EventKind::Reopened => "reopened",
            EventKind::Ready => "ready",
            EventKind::Blocked => "blocked",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A typed change to one issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueEvent {
    pub kind: EventKind,
    pub issue: Issue,
    /// State before the change; absent for created events
    pub previous: Option<Issue>,
}

impl IssueEvent {
    pub fn new(kind: EventKind, issue: Issue, previous: Option<Issue>) -> Self {
        Self {
            kind,
            issue,
            previous,
        }
    }
}

/// Options for [`detect_events`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectOptions {
    pub diff: DiffOptions,
    pub readiness: ReadinessPolicy,
}

/// All events between two snapshots: change events first (created, closed,
/// reopened, updated, each in ID order), then readiness flips in ID order.
pub fn detect_events(before: &Snapshot, after: &Snapshot, options: DetectOptions) -> Vec<IssueEvent> {
    let changes = diff_with(before, after, options.diff);
    let mut events = Vec::with_capacity(changes.len());

    for issue in changes.created {
        events.push(IssueEvent::new(EventKind::Created, issue, None));
    }
    for change in changes.closed {
        events.push(IssueEvent::new(
            EventKind::Closed,
            change.after,
            Some(change.before),
        ));
    }
    for change in changes.updated {
        let kind = if change.before.is_closed() && !change.after.is_closed() {
            EventKind::Reopened
        } else {
            EventKind::Updated
        };
        events.push(IssueEvent::new(kind, change.after, Some(change.before)));
    }

    let flips = readiness_flips(
        &Readiness::classify_with(before, options.readiness),
        &Readiness::classify_with(after, options.readiness),
    );
    for flip in flips {
        let (Some(issue), Some(previous)) = (after.get(&flip.id), before.get(&flip.id)) else {
            continue;
        };
        let kind = match flip.now {
            ReadinessState::Ready => EventKind::Ready,
            ReadinessState::Blocked => EventKind::Blocked,
        };
        events.push(IssueEvent::new(kind, issue.clone(), Some(previous.clone())));
    }

    events
}
