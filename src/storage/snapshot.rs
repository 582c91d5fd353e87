//! Folded, last-revision-wins view of the issue log.

use crate::models::Issue;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// An immutable mapping from issue ID to issue at one instant.
///
/// The `blocks` relation is derived when the snapshot is built and is always
/// the exact inverse of `depends_on` across the snapshot's issues.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    issues: BTreeMap<String, Issue>,
    blocks: HashMap<String, BTreeSet<String>>,
    revision: String,
    source_len: u64,
    skipped_lines: usize,
}

impl Snapshot {
    /// A snapshot with no issues.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Fold log content line by line; the last revision of each ID wins.
    ///
    /// Lines are decoded one at a time; lines that are not UTF-8 or fail
    /// validation are skipped and counted.
    pub fn parse(content: impl AsRef<[u8]>) -> Self {
        let content = content.as_ref();
        let mut issues = BTreeMap::new();
        let mut skipped_lines = 0;

        for (index, raw) in content.split(|b| *b == b'\n').enumerate() {
            let line = match std::str::from_utf8(raw) {
                Ok(line) => line,
                Err(e) => {
                    skipped_lines += 1;
                    debug!(line = index + 1, error = %e, "skipping non-UTF-8 issue log line");
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match Issue::parse_line(line) {
                Ok(issue) => {
                    issues.insert(issue.id.clone(), issue);
                }
                Err(e) => {
                    skipped_lines += 1;
                    debug!(line = index + 1, error = %e, "skipping issue log line");
                }
            }
        }

        let mut snapshot = Self::from_map(issues);
        snapshot.source_len = content.len() as u64;
        snapshot.skipped_lines = skipped_lines;
        snapshot
    }

    /// Build a snapshot from issues in order; later duplicates replace earlier ones.
    pub fn from_issues(issues: impl IntoIterator<Item = Issue>) -> Self {
        let map = issues
            .into_iter()
            .map(|issue| (issue.id.clone(), issue))
            .collect();
        Self::from_map(map)
    }

    fn from_map(issues: BTreeMap<String, Issue>) -> Self {
        let mut blocks: HashMap<String, BTreeSet<String>> = HashMap::new();
        for issue in issues.values() {
            for dep in &issue.depends_on {
                if issues.contains_key(dep) {
                    blocks
                        .entry(dep.clone())
                        .or_default()
                        .insert(issue.id.clone());
                }
            }
        }
        Self {
            issues,
            blocks,
            revision: String::new(),
            source_len: 0,
            skipped_lines: 0,
        }
    }

    /// Attach the revision marker of the log this snapshot was read from.
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Byte length of the content this snapshot was parsed from.
    pub fn source_len(&self) -> u64 {
        self.source_len
    }

    /// Number of non-empty lines that failed validation.
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    pub fn get(&self, id: &str) -> Option<&Issue> {
        self.issues.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.issues.contains_key(id)
    }

    /// All issues in ID order.
    pub fn issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.values()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// IDs of issues that depend on `id`.
    pub fn blocks(&self, id: &str) -> Vec<&str> {
        self.blocks
            .get(id)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// `(issue, missing dependency)` pairs where the dependency is not in the snapshot.
    pub fn dangling_dependencies(&self) -> Vec<(&str, &str)> {
        let issues = &self.issues;
        issues
            .values()
            .flat_map(move |issue| {
                issue
                    .depends_on
                    .iter()
                    .filter(move |dep| !issues.contains_key(dep.as_str()))
                    .map(move |dep| (issue.id.as_str(), dep.as_str()))
            })
            .collect()
    }

    /// An issue together with its derived `blocks` set, for serialization.
    pub fn view(&self, id: &str) -> Option<IssueView<'_>> {
        self.get(id).map(|issue| IssueView {
            issue,
            blocks: self.blocks(id),
        })
    }
}

/// Serializable issue with its derived `blocks` relation.
#[derive(Debug, Serialize)]
pub struct IssueView<'a> {
    #[serde(flatten)]
    pub issue: &'a Issue,
    pub blocks: Vec<&'a str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IssueStatus;

    fn line(id: &str, title: &str, status: &str, deps: &[&str]) -> String {
        serde_json::json!({
            "id": id,
            "title": title,
            "status": status,
            "type": "task",
            "priority": 2,
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "depends_on": deps,
        })
        .to_string()
    }

    #[test]
    fn test_last_revision_wins() {
        let content = [
            line("bw-1", "first", "open", &[]),
            line("bw-1", "second", "in_progress", &[]),
            line("bw-2", "other", "open", &[]),
        ]
        .join("\n");

        let snapshot = Snapshot::parse(&content);
        assert_eq!(snapshot.len(), 2);
        let issue = snapshot.get("bw-1").unwrap();
        assert_eq!(issue.title, "second");
        assert_eq!(issue.status, IssueStatus::InProgress);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let content = format!(
            "{}\n\nnot json\n{{\"id\":\"bw-9\"}}\n{}",
            line("bw-1", "a", "open", &[]),
            line("bw-2", "b", "done", &[])
        );
        let snapshot = Snapshot::parse(&content);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains("bw-1"));
        assert_eq!(snapshot.skipped_lines(), 3);
        assert_eq!(snapshot.source_len(), content.len() as u64);
    }

    #[test]
    fn test_non_utf8_line_is_skipped() {
        let mut content = line("bw-1", "a", "open", &[]).into_bytes();
        content.extend_from_slice(b"\n\xff\xfe garbage\n");
        content.extend_from_slice(line("bw-2", "b", "open", &[]).as_bytes());
        content.extend_from_slice(b"\r\n");

        let snapshot = Snapshot::parse(&content);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.skipped_lines(), 1);
        assert_eq!(snapshot.source_len(), content.len() as u64);
    }

    #[test]
    fn test_blocks_is_inverse_of_depends_on() {
        let content = [
            line("bw-1", "base", "open", &[]),
            line("bw-2", "needs 1", "open", &["bw-1"]),
            line("bw-3", "needs 1 and ghost", "open", &["bw-1", "bw-404"]),
        ]
        .join("\n");
        let snapshot = Snapshot::parse(&content);

        assert_eq!(snapshot.blocks("bw-1"), vec!["bw-2", "bw-3"]);
        assert!(snapshot.blocks("bw-2").is_empty());
        assert!(snapshot.blocks("bw-404").is_empty());
        assert_eq!(snapshot.dangling_dependencies(), vec![("bw-3", "bw-404")]);
    }

    #[test]
    fn test_blocks_recomputed_on_new_revision() {
        let content = [
            line("bw-1", "base", "open", &[]),
            line("bw-2", "needs 1", "open", &["bw-1"]),
            line("bw-2", "needs nothing", "open", &[]),
        ]
        .join("\n");
        let snapshot = Snapshot::parse(&content);
        assert!(snapshot.blocks("bw-1").is_empty());
    }

    #[test]
    fn test_view_includes_blocks() {
        let content = [
            line("bw-1", "base", "open", &[]),
            line("bw-2", "needs 1", "open", &["bw-1"]),
        ]
        .join("\n");
        let snapshot = Snapshot::parse(&content);
        let json = serde_json::to_value(snapshot.view("bw-1").unwrap()).unwrap();
        assert_eq!(json["id"], "bw-1");
        assert_eq!(json["blocks"], serde_json::json!(["bw-2"]));
        assert!(snapshot.view("bw-404").is_none());
    }
}
