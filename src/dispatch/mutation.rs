//! Mutation capability exposed to handlers.
//!
//! Bellwether never writes the issue log itself. Handlers that want to create,
//! update or close an issue go through a [`Mutator`], which hands the request
//! to whatever external tool owns the log.

use crate::models::{Issue, IssueKind, IssueStatus};
use futures::future::BoxFuture;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

/// Fields of an issue to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIssue {
    pub title: String,
    pub kind: IssueKind,
    pub priority: Option<u8>,
    pub description: Option<String>,
    pub depends_on: Vec<String>,
}

impl NewIssue {
    /// A task with just a title.
    pub fn task(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            kind: IssueKind::Task,
            priority: None,
            description: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: IssueKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }
}

/// Changes to an existing issue. Unset fields are left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueUpdate {
    pub id: String,
    pub title: Option<String>,
    pub status: Option<IssueStatus>,
    pub priority: Option<u8>,
    pub assignee: Option<String>,
    pub description: Option<String>,
}

impl IssueUpdate {
    /// An update that changes nothing yet.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            status: None,
            priority: None,
            assignee: None,
            description: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_status(mut self, status: IssueStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A requested change to the issue log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationRequest {
    Create(NewIssue),
    Update(IssueUpdate),
    Close { id: String, reason: Option<String> },
}

impl MutationRequest {
    pub fn close(id: impl Into<String>, reason: Option<String>) -> Self {
        MutationRequest::Close {
            id: id.into(),
            reason,
        }
    }

    /// Command-line arguments for the external tool, ending in `--json`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        match self {
            MutationRequest::Create(issue) => {
                args.extend(["create".to_string(), issue.title.clone()]);
                args.extend(["--type".to_string(), issue.kind.as_str().to_string()]);
                if let Some(p) = issue.priority {
                    args.extend(["--priority".to_string(), p.to_string()]);
                }
                if let Some(d) = &issue.description {
                    args.extend(["--description".to_string(), d.clone()]);
                }
                for dep in &issue.depends_on {
                    args.extend(["--depends-on".to_string(), dep.clone()]);
                }
            }
            MutationRequest::Update(update) => {
                args.extend(["update".to_string(), update.id.clone()]);
                if let Some(t) = &update.title {
                    args.extend(["--title".to_string(), t.clone()]);
                }
                if let Some(s) = update.status {
                    args.extend(["--status".to_string(), s.as_str().to_string()]);
                }
                if let Some(p) = update.priority {
                    args.extend(["--priority".to_string(), p.to_string()]);
                }
                if let Some(a) = &update.assignee {
                    args.extend(["--assignee".to_string(), a.clone()]);
                }
                if let Some(d) = &update.description {
                    args.extend(["--description".to_string(), d.clone()]);
                }
            }
            MutationRequest::Close { id, reason } => {
                args.extend(["close".to_string(), id.clone()]);
                if let Some(r) = reason {
                    args.extend(["--reason".to_string(), r.clone()]);
                }
            }
        }
        args.push("--json".to_string());
        args
    }
}

impl From<NewIssue> for MutationRequest {
    fn from(issue: NewIssue) -> Self {
        MutationRequest::Create(issue)
    }
}

impl From<IssueUpdate> for MutationRequest {
    fn from(update: IssueUpdate) -> Self {
        MutationRequest::Update(update)
    }
}

/// Outcome of a mutation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationResult {
    pub success: bool,
    /// The resulting issue, when the external tool reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<Issue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MutationResult {
    pub fn succeeded(issue: Option<Issue>) -> Self {
        Self {
            success: true,
            issue,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            issue: None,
            error: Some(error.into()),
        }
    }
}

/// Applies mutation requests on behalf of handlers.
pub trait Mutator: Send + Sync {
    fn apply(&self, request: MutationRequest) -> BoxFuture<'_, MutationResult>;
}

/// Used when no mutation command is configured; every request fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMutator;

impl Mutator for NoMutator {
    fn apply(&self, _request: MutationRequest) -> BoxFuture<'_, MutationResult> {
        Box::pin(async { MutationResult::failed("no mutation command configured") })
    }
}

/// Runs a configured external command for each request.
///
/// The request becomes `<command> create|update|close ... --json`. A zero exit
/// is success; stdout is parsed as the resulting issue when possible.
#[derive(Debug, Clone)]
pub struct CommandMutator {
    program: String,
    base_args: Vec<String>,
    working_dir: PathBuf,
    timeout: Option<Duration>,
}

impl CommandMutator {
    /// `command` is split on whitespace, so `"tracker issue"` runs `tracker` with `issue` first.
    pub fn new(command: &str, working_dir: impl Into<PathBuf>) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            base_args: parts.collect(),
            working_dir: working_dir.into(),
            timeout: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, request: MutationRequest) -> MutationResult {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.base_args)
            .args(request.to_args())
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program, ?request, "running mutation command");
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
                Ok(output) => output,
                Err(_) => {
                    return MutationResult::failed(format!(
                        "mutation command timed out after {:?}",
                        limit
                    ));
                }
            },
            None => cmd.output().await,
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return MutationResult::failed(format!(
                    "failed to run mutation command '{}': {}",
                    self.program, e
                ));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.trim();
            return MutationResult::failed(if message.is_empty() {
                format!("mutation command exited with {}", output.status)
            } else {
                message.to_string()
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        MutationResult::succeeded(Issue::parse_line(stdout.trim()).ok())
    }
}

impl Mutator for CommandMutator {
    fn apply(&self, request: MutationRequest) -> BoxFuture<'_, MutationResult> {
        Box::pin(self.run(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_args() {
        let request = MutationRequest::from(
            NewIssue::task("Follow up")
                .with_kind(IssueKind::Bug)
                .with_priority(1)
                .depends_on("bw-1"),
        );
        assert_eq!(
            request.to_args(),
            vec![
                "create",
                "Follow up",
                "--type",
                "bug",
                "--priority",
                "1",
                "--depends-on",
                "bw-1",
                "--json"
            ]
        );
    }

    #[test]
    fn test_update_and_close_args() {
        let update = MutationRequest::from(IssueUpdate::new("bw-2").with_status(IssueStatus::InProgress));
        assert_eq!(
            update.to_args(),
            vec!["update", "bw-2", "--status", "in_progress", "--json"]
        );

        let close = MutationRequest::close("bw-2", Some("done".to_string()));
        assert_eq!(
            close.to_args(),
            vec!["close", "bw-2", "--reason", "done", "--json"]
        );
    }

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(CommandMutator::new("   ", ".").is_none());
        let mutator = CommandMutator::new("tracker issue", ".").unwrap();
        assert_eq!(mutator.program, "tracker");
        assert_eq!(mutator.base_args, vec!["issue"]);
    }

    #[tokio::test]
    async fn test_no_mutator_fails() {
        let result = NoMutator.apply(NewIssue::task("x").into()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no mutation command"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_mutator_reports_exit_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let ok = CommandMutator::new("true", dir.path()).unwrap();
        let result = ok.apply(MutationRequest::close("bw-1", None)).await;
        assert!(result.success);
        assert!(result.issue.is_none());

        let failing = CommandMutator::new("false", dir.path()).unwrap();
        let result = failing.apply(MutationRequest::close("bw-1", None)).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }
}
