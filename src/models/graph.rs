//! Dependency readiness analysis.
//!
//! Classifies every non-closed issue in a snapshot as ready or blocked, detects
//! issues whose classification flipped between two snapshots, and aggregates
//! epic progress over an epic's children.
//!
//! A dependency blocks only when it is present in the snapshot and not closed.
//! References to IDs missing from the snapshot never block.

use crate::models::{Epic, EpicProgress, Issue};
use crate::storage::Snapshot;
use serde::Serialize;
use std::collections::BTreeSet;

/// Knobs for readiness classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Whether a dependency on an open epic blocks the dependent issue
    pub epics_block: bool,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self { epics_block: true }
    }
}

/// Ready/blocked state of a non-closed issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    Ready,
    Blocked,
}

/// Ready and blocked sets for one snapshot. Closed issues are in neither.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    ready: BTreeSet<String>,
    blocked: BTreeSet<String>,
}

impl Readiness {
    /// Classify with the default policy.
    pub fn classify(snapshot: &Snapshot) -> Self {
        Self::classify_with(snapshot, ReadinessPolicy::default())
    }

    pub fn classify_with(snapshot: &Snapshot, policy: ReadinessPolicy) -> Self {
        let mut readiness = Self::default();
        for issue in snapshot.issues().filter(|i| !i.is_closed()) {
            if blockers_with(snapshot, issue, policy).is_empty() {
                readiness.ready.insert(issue.id.clone());
            } else {
                readiness.blocked.insert(issue.id.clone());
            }
        }
        readiness
    }

    pub fn state(&self, id: &str) -> Option<ReadinessState> {
        if self.ready.contains(id) {
            Some(ReadinessState::Ready)
        } else if self.blocked.contains(id) {
            Some(ReadinessState::Blocked)
        } else {
            None
        }
    }

    pub fn is_ready(&self, id: &str) -> bool {
        self.ready.contains(id)
    }

    pub fn is_blocked(&self, id: &str) -> bool {
        self.blocked.contains(id)
    }

    /// Ready IDs in order.
    pub fn ready(&self) -> impl Iterator<Item = &str> {
        self.ready.iter().map(String::as_str)
    }

    /// Blocked IDs in order.
    pub fn blocked(&self) -> impl Iterator<Item = &str> {
        self.blocked.iter().map(String::as_str)
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }
}

/// Dependencies of `issue` that currently block it, using the default policy.
pub fn blockers<'a>(snapshot: &'a Snapshot, issue: &'a Issue) -> Vec<&'a str> {
    blockers_with(snapshot, issue, ReadinessPolicy::default())
}

pub fn blockers_with<'a>(
    snapshot: &'a Snapshot,
    issue: &'a Issue,
    policy: ReadinessPolicy,
) -> Vec<&'a str> {
    issue
        .depends_on
        .iter()
        .filter(|dep| match snapshot.get(dep) {
            Some(dep_issue) => {
                !dep_issue.is_closed() && (policy.epics_block || !dep_issue.is_epic())
            }
            None => false,
        })
        .map(String::as_str)
        .collect()
}

/// An issue whose ready/blocked classification changed between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessFlip {
    pub id: String,
    pub now: ReadinessState,
}

/// Issues present and non-closed in both snapshots whose state changed, in ID order.
pub fn readiness_flips(before: &Readiness, after: &Readiness) -> Vec<ReadinessFlip> {
    let became_ready = after
        .ready
        .intersection(&before.blocked)
        .map(|id| ReadinessFlip {
            id: id.clone(),
            now: ReadinessState::Ready,
        });
    let became_blocked = after
        .blocked
        .intersection(&before.ready)
        .map(|id| ReadinessFlip {
            id: id.clone(),
            now: ReadinessState::Blocked,
        });

    let mut flips: Vec<ReadinessFlip> = became_ready.chain(became_blocked).collect();
    flips.sort_by(|a, b| a.id.cmp(&b.id));
    flips
}

/// Non-epic issues whose `depends_on` names the epic, in ID order.
pub fn epic_children<'a>(snapshot: &'a Snapshot, epic_id: &str) -> Vec<&'a Issue> {
    snapshot
        .issues()
        .filter(|issue| !issue.is_epic() && issue.depends_on.contains(epic_id))
        .collect()
}

/// Progress of an epic, or `None` if `epic_id` is not an epic in the snapshot.
pub fn epic_progress(snapshot: &Snapshot, epic_id: &str) -> Option<EpicProgress> {
    let epic = snapshot.get(epic_id)?;
    if !epic.is_epic() {
        return None;
    }
    let children = epic_children(snapshot, epic_id);
    let closed = children.iter().filter(|c| c.is_closed()).count();
    Some(EpicProgress::new(children.len(), closed))
}

/// All epics with their children and progress.
pub fn epics(snapshot: &Snapshot) -> Vec<Epic> {
    snapshot
        .issues()
        .filter(|issue| issue.is_epic())
        .map(|epic| {
            let children = epic_children(snapshot, &epic.id);
            let closed = children.iter().filter(|c| c.is_closed()).count();
            Epic {
                issue: epic.clone(),
                progress: EpicProgress::new(children.len(), closed),
                children: children.into_iter().map(|c| c.id.clone()).collect(),
            }
        })
        .collect()
}
