//! Command implementations for the bellwether CLI.
//!
//! Each command returns a value implementing [`Output`] so `main` can print
//! it as JSON (the default) or as human-readable text.
//!
//! - `watch` - run the daemon until a shutdown signal
//! - `run`, `trigger`, `retry` - one-shot dispatch
//! - `ready`, `blocked`, `epics`, `diff` - read-only views of the log
//! - `ledger_list`, `ledger_failed` - execution history
//! - `config_show` - resolved configuration

use crate::config::{self, ConfigOverrides, ResolvedConfig, resolve_config};
use crate::daemon::{Daemon, DaemonStats};
use crate::diff::{EventKind, IssueEvent, detect_events};
use crate::dispatch::{
    CommandMutator, DirectoryResolver, DispatchOutcome, Dispatcher, Mutator, NoMutator,
};
use crate::ledger::Ledger;
use crate::models::execution::{
    ExecutionRecord, ExecutionStatus, ExecutionType, LedgerFilter, RetryInfo, Trigger,
};
use crate::models::graph::{self, Readiness};
use crate::models::{Epic, Issue};
use crate::scheduler::Scheduler;
use crate::storage::{Snapshot, Storage, load_snapshot_file};
use crate::{Error, Result};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Output {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error": "{}"}}"#, e))
}

/// Load the storage and resolved configuration for a project path.
pub fn open_project(repo_path: &Path, overrides: &ConfigOverrides) -> Result<(Storage, ResolvedConfig)> {
    let storage = Storage::open(repo_path)?;
    let config = resolve_config(&storage, overrides)?;
    Ok((storage, config))
}

/// Build a dispatcher from resolved configuration.
pub fn build_dispatcher(storage: &Storage, config: &ResolvedConfig) -> Dispatcher {
    let timeout = config.handler_timeout();
    let resolver = DirectoryResolver::new(&config.handlers_dir.value).with_timeout(timeout);
    let mutator: Arc<dyn Mutator> = match config
        .mutation_command()
        .and_then(|cmd| CommandMutator::new(cmd, storage.project_root()))
    {
        Some(mutator) => Arc::new(mutator.with_timeout(timeout)),
        None => Arc::new(NoMutator),
    };

    Dispatcher::new(Ledger::open(storage), Arc::new(resolver))
        .with_mutator(mutator)
        .with_scope(config.idempotency.value)
        .with_policy(config.readiness_policy())
        .with_project_dir(storage.project_root())
}

async fn load_current(storage: &Storage) -> Result<Arc<Snapshot>> {
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || storage.load_snapshot())
        .await
        .map_err(|e| Error::Other(format!("snapshot reader failed: {}", e)))?
        .map(Arc::new)
}

fn outcome_line(outcome: &DispatchOutcome) -> String {
    match outcome {
        DispatchOutcome::NoHandler => "no handler".to_string(),
        DispatchOutcome::AlreadyExecuted => "skipped (already executed)".to_string(),
        DispatchOutcome::Succeeded(r) => format!("ok via {} ({}ms)", r.handler, r.duration_ms),
        DispatchOutcome::Failed(r) => format!(
            "FAILED via {}: {}",
            r.handler,
            r.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

// === Ready / Blocked ===

/// An issue with its derived relations, as listed by `ready` and `blocked`.
#[derive(Serialize)]
pub struct IssueEntry {
    #[serde(flatten)]
    pub issue: Issue,
    pub blocks: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
}

impl IssueEntry {
    fn human_line(&self) -> String {
        let mut line = format!(
            "  [P{}] {}: {} ({})",
            self.issue.priority, self.issue.id, self.issue.title, self.issue.status.as_str()
        );
        if !self.blocked_by.is_empty() {
            line.push_str(&format!("\n        waiting on: {}", self.blocked_by.join(", ")));
        }
        line
    }
}

#[derive(Serialize)]
pub struct IssueListResult {
    pub issues: Vec<IssueEntry>,
    pub count: usize,
    #[serde(skip)]
    label: &'static str,
}

impl Output for IssueListResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.issues.is_empty() {
            return format!("No {} issues.", self.label);
        }
        let mut lines = vec![format!("{} {} issue(s):", self.count, self.label)];
        lines.extend(self.issues.iter().map(IssueEntry::human_line));
        lines.join("\n")
    }
}

fn issue_list(
    snapshot: &Snapshot,
    config: &ResolvedConfig,
    ids: impl Iterator<Item = String>,
    label: &'static str,
) -> IssueListResult {
    let policy = config.readiness_policy();
    let mut issues: Vec<IssueEntry> = ids
        .filter_map(|id| snapshot.get(&id))
        .map(|issue| IssueEntry {
            issue: issue.clone(),
            blocks: snapshot.blocks(&issue.id).into_iter().map(String::from).collect(),
            blocked_by: graph::blockers_with(snapshot, issue, policy)
                .into_iter()
                .map(String::from)
                .collect(),
        })
        .collect();
    issues.sort_by(|a, b| {
        a.issue
            .priority
            .cmp(&b.issue.priority)
            .then_with(|| a.issue.id.cmp(&b.issue.id))
    });

    IssueListResult {
        count: issues.len(),
        issues,
        label,
    }
}

/// Open issues whose dependencies are all closed.
pub fn ready(repo_path: &Path) -> Result<IssueListResult> {
    let (storage, config) = open_project(repo_path, &ConfigOverrides::new())?;
    let snapshot = storage.load_snapshot()?;
    let readiness = Readiness::classify_with(&snapshot, config.readiness_policy());
    let ids: Vec<String> = readiness.ready().map(String::from).collect();
    Ok(issue_list(&snapshot, &config, ids.into_iter(), "ready"))
}

/// Open issues with at least one open dependency.
pub fn blocked(repo_path: &Path) -> Result<IssueListResult> {
    let (storage, config) = open_project(repo_path, &ConfigOverrides::new())?;
    let snapshot = storage.load_snapshot()?;
    let readiness = Readiness::classify_with(&snapshot, config.readiness_policy());
    let ids: Vec<String> = readiness.blocked().map(String::from).collect();
    Ok(issue_list(&snapshot, &config, ids.into_iter(), "blocked"))
}

// === Epics ===

#[derive(Serialize)]
pub struct EpicsResult {
    pub epics: Vec<Epic>,
    pub count: usize,
}

impl Output for EpicsResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.epics.is_empty() {
            return "No epics.".to_string();
        }
        let mut lines = vec![format!("{} epic(s):", self.count)];
        for epic in &self.epics {
            lines.push(format!(
                "  {}: {} [{}/{} closed, {:.0}%] ({})",
                epic.issue.id,
                epic.issue.title,
                epic.progress.closed,
                epic.progress.total,
                epic.progress.percentage,
                epic.issue.status.as_str()
            ));
        }
        lines.join("\n")
    }
}

pub fn epics(repo_path: &Path) -> Result<EpicsResult> {
    let storage = Storage::open(repo_path)?;
    let snapshot = storage.load_snapshot()?;
    let epics = graph::epics(&snapshot);
    Ok(EpicsResult {
        count: epics.len(),
        epics,
    })
}

// === Diff ===

#[derive(Serialize)]
pub struct DiffResult {
    pub events: Vec<IssueEvent>,
    pub count: usize,
}

impl Output for DiffResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.events.is_empty() {
            return "No changes.".to_string();
        }
        let mut lines = vec![format!("{} event(s):", self.count)];
        for event in &self.events {
            lines.push(format!(
                "  {:<9} {}: {}",
                event.kind.as_str(),
                event.issue.id,
                event.issue.title
            ));
        }
        lines.join("\n")
    }
}

/// Events between two log files.
///
/// Uses the project's config for label and epic options when run inside a
/// project, and the defaults otherwise.
pub fn diff(repo_path: &Path, before: &Path, after: &Path) -> Result<DiffResult> {
    let options = match Storage::open(repo_path) {
        Ok(storage) => resolve_config(&storage, &ConfigOverrides::new())?.detect_options(),
        Err(Error::NotInitialized(_)) => Default::default(),
        Err(e) => return Err(e),
    };
    let before = load_snapshot_file(before)?;
    let after = load_snapshot_file(after)?;
    let events = detect_events(&before, &after, options);
    Ok(DiffResult {
        count: events.len(),
        events,
    })
}

// === Run ===

/// Where `run` takes its before-snapshot from.
#[derive(Debug, Clone, Default)]
pub enum Baseline {
    /// Treat every issue as created
    #[default]
    Empty,
    File(PathBuf),
    GitRevision(String),
}

#[derive(Serialize)]
pub struct RunEntry {
    pub event: EventKind,
    pub issue_id: String,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
}

#[derive(Serialize)]
pub struct RunResult {
    pub revision: String,
    pub events: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<RunEntry>,
}

impl Output for RunResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!(
            "{} event(s) at {}: {} succeeded, {} failed, {} skipped",
            self.events, self.revision, self.succeeded, self.failed, self.skipped
        )];
        for entry in &self.results {
            lines.push(format!(
                "  {:<9} {}: {}",
                entry.event.as_str(),
                entry.issue_id,
                outcome_line(&entry.outcome)
            ));
        }
        lines.join("\n")
    }
}

/// One reconciliation pass from `baseline` to the current log.
pub async fn run(repo_path: &Path, overrides: &ConfigOverrides, baseline: Baseline) -> Result<RunResult> {
    let (storage, config) = open_project(repo_path, overrides)?;
    let before = match &baseline {
        Baseline::Empty => Snapshot::empty(),
        Baseline::File(path) => load_snapshot_file(path)?,
        Baseline::GitRevision(rev) => storage.load_snapshot_at(rev)?,
    };
    let after = load_current(&storage).await?;
    let events = detect_events(&before, &after, config.detect_options());

    let dispatcher = build_dispatcher(&storage, &config);
    let outcomes = dispatcher.dispatch_all(&events, &after, Trigger::Run).await?;

    let mut result = RunResult {
        revision: after.revision().to_string(),
        events: events.len(),
        succeeded: 0,
        failed: 0,
        skipped: 0,
        results: Vec::with_capacity(events.len()),
    };
    for (event, outcome) in events.into_iter().zip(outcomes) {
        match &outcome {
            DispatchOutcome::Succeeded(_) => result.succeeded += 1,
            DispatchOutcome::Failed(_) => result.failed += 1,
            DispatchOutcome::AlreadyExecuted => result.skipped += 1,
            DispatchOutcome::NoHandler => {}
        }
        result.results.push(RunEntry {
            event: event.kind,
            issue_id: event.issue.id,
            outcome,
        });
    }
    Ok(result)
}

// === Trigger ===

#[derive(Serialize)]
pub struct TriggerResult {
    pub event: String,
    pub issue_id: String,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
}

impl Output for TriggerResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "{} {}: {}",
            self.event,
            self.issue_id,
            outcome_line(&self.outcome)
        )
    }
}

fn parse_event(event: &str) -> Result<EventKind> {
    EventKind::parse(event).ok_or_else(|| {
        let names: Vec<_> = EventKind::ALL.iter().map(|k| k.as_str()).collect();
        Error::InvalidInput(format!(
            "Unknown event '{}'. Expected one of: {}",
            event,
            names.join(", ")
        ))
    })
}

pub async fn trigger(repo_path: &Path, overrides: &ConfigOverrides, event: &str, issue_id: &str) -> Result<TriggerResult> {
    let event = parse_event(event)?;
    let (storage, config) = open_project(repo_path, overrides)?;
    let snapshot = load_current(&storage).await?;
    let dispatcher = build_dispatcher(&storage, &config);
    let outcome = dispatcher.trigger(event.as_str(), issue_id, &snapshot).await?;
    Ok(TriggerResult {
        event: event.as_str().to_string(),
        issue_id: issue_id.to_string(),
        outcome,
    })
}

// === Retry ===

#[derive(Serialize)]
pub struct RetryResult {
    pub issue_id: String,
    pub event: String,
    pub dry_run: bool,
    /// The failure being retried, if any
    pub failure: Option<RetryInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DispatchOutcome>,
}

impl Output for RetryResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let Some(failure) = &self.failure else {
            return format!(
                "No failed execution of '{}' for {}.",
                self.event, self.issue_id
            );
        };
        let mut lines = vec![format!(
            "Last failure of '{}' for {} via {} at {}: {}",
            self.event,
            self.issue_id,
            failure.handler,
            failure.failed_at.format("%Y-%m-%d %H:%M:%S UTC"),
            failure.error.as_deref().unwrap_or("unknown error")
        )];
        match &self.result {
            Some(outcome) => lines.push(format!("Retried: {}", outcome_line(outcome))),
            None if self.dry_run => lines.push("Dry run, not retried.".to_string()),
            None => {}
        }
        lines.join("\n")
    }
}

pub async fn retry(
    repo_path: &Path,
    overrides: &ConfigOverrides,
    issue_id: &str,
    event: &str,
    dry_run: bool,
) -> Result<RetryResult> {
    let (storage, config) = open_project(repo_path, overrides)?;
    let dispatcher = build_dispatcher(&storage, &config);
    let failure = dispatcher.ledger().retry(issue_id, event)?;

    let result = if dry_run || failure.is_none() {
        None
    } else {
        let snapshot = load_current(&storage).await?;
        dispatcher.retry(issue_id, event, &snapshot).await?
    };

    Ok(RetryResult {
        issue_id: issue_id.to_string(),
        event: event.to_string(),
        dry_run,
        failure,
        result,
    })
}

// === Ledger ===

#[derive(Serialize)]
pub struct LedgerListResult {
    pub records: Vec<ExecutionRecord>,
    pub count: usize,
}

impl Output for LedgerListResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.records.is_empty() {
            return "No executions recorded.".to_string();
        }
        let mut lines = vec![format!("{} execution(s):", self.count)];
        for record in &self.records {
            let subject = match (&record.issue_id, &record.event, &record.schedule) {
                (Some(issue), Some(event), _) => format!("{} {}", event, issue),
                (_, _, Some(schedule)) => format!("schedule {}", schedule),
                _ => record.execution_type.as_str().to_string(),
            };
            let mut line = format!(
                "  {} {:<7} {} via {} [{}, {}ms]",
                record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                record.status.as_str(),
                subject,
                record.handler,
                record.trigger,
                record.duration_ms
            );
            if let Some(error) = &record.error {
                line.push_str(&format!("\n        {}", error));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

pub fn ledger_list(
    repo_path: &Path,
    issue: Option<&str>,
    status: Option<&str>,
    execution_type: Option<&str>,
) -> Result<LedgerListResult> {
    let mut filter = LedgerFilter::new();
    if let Some(issue) = issue {
        filter = filter.with_issue(issue);
    }
    if let Some(status) = status {
        let status = ExecutionStatus::parse(status).ok_or_else(|| {
            Error::InvalidInput(format!(
                "Invalid status '{}'. Expected success or failed",
                status
            ))
        })?;
        filter = filter.with_status(status);
    }
    if let Some(execution_type) = execution_type {
        let execution_type = ExecutionType::parse(execution_type).ok_or_else(|| {
            Error::InvalidInput(format!(
                "Invalid type '{}'. Expected issue, schedule or manual",
                execution_type
            ))
        })?;
        filter = filter.with_type(execution_type);
    }

    let storage = Storage::open(repo_path)?;
    let records = Ledger::open(&storage).list(&filter)?;
    Ok(LedgerListResult {
        count: records.len(),
        records,
    })
}

pub fn ledger_failed(repo_path: &Path) -> Result<LedgerListResult> {
    let storage = Storage::open(repo_path)?;
    let records = Ledger::open(&storage).list_failed()?;
    Ok(LedgerListResult {
        count: records.len(),
        records,
    })
}

// === Config ===

#[derive(Serialize)]
pub struct ConfigShowResult {
    pub project_config: PathBuf,
    pub system_config: Option<PathBuf>,
    pub config: ResolvedConfig,
}

impl Output for ConfigShowResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let c = &self.config;
        let mut lines = vec![
            format!("Project config: {}", self.project_config.display()),
            format!(
                "System config:  {}",
                self.system_config
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(none)".to_string())
            ),
            String::new(),
            format!("  debounce-ms = {} ({})", c.debounce_ms.value, c.debounce_ms.source),
            format!(
                "  poll-interval-ms = {} ({})",
                c.poll_interval_ms.value, c.poll_interval_ms.source
            ),
            format!(
                "  handlers-dir = {} ({})",
                c.handlers_dir.value.display(),
                c.handlers_dir.source
            ),
        ];
        match &c.handler_timeout_secs {
            Some(t) => lines.push(format!("  handler-timeout-secs = {} ({})", t.value, t.source)),
            None => lines.push("  handler-timeout-secs = none (default)".to_string()),
        }
        lines.push(format!(
            "  label-changes = {} ({})",
            c.label_changes.value, c.label_changes.source
        ));
        lines.push(format!(
            "  epics-block-children = {} ({})",
            c.epics_block_children.value, c.epics_block_children.source
        ));
        lines.push(format!(
            "  idempotency = {} ({})",
            c.idempotency.value, c.idempotency.source
        ));
        if let Some(cmd) = &c.mutation_command {
            lines.push(format!("  mutation-command = {} ({})", cmd.value, cmd.source));
        }
        for schedule in &c.schedules {
            lines.push(format!(
                "  schedule {} every {} ({})",
                schedule.value.name, schedule.value.every, schedule.source
            ));
        }
        lines.join("\n")
    }
}

pub fn config_show(repo_path: &Path, overrides: &ConfigOverrides) -> Result<ConfigShowResult> {
    let (storage, config) = open_project(repo_path, overrides)?;
    Ok(ConfigShowResult {
        project_config: storage.config_path(),
        system_config: config::system_config_path(),
        config,
    })
}

// === Watch ===

#[derive(Serialize)]
pub struct WatchResult {
    pub stopped: bool,
    #[serde(flatten)]
    pub stats: DaemonStats,
}

impl Output for WatchResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Stopped after {} pass(es): {} succeeded, {} failed, {} skipped, {} schedule run(s).",
            self.stats.passes,
            self.stats.succeeded,
            self.stats.failed,
            self.stats.skipped,
            self.stats.schedules_fired
        )
    }
}

/// Run the daemon until `shutdown` completes.
pub async fn watch(
    repo_path: &Path,
    overrides: &ConfigOverrides,
    shutdown: impl Future<Output = ()>,
) -> Result<WatchResult> {
    let (storage, config) = open_project(repo_path, overrides)?;
    let dispatcher = build_dispatcher(&storage, &config);
    let scheduler = Scheduler::new(config.schedule_registry()?);

    let mut daemon = Daemon::new(storage, config.watch_config(), dispatcher, scheduler);
    daemon.start().await?;
    shutdown.await;
    let stats = daemon.stop().await;

    Ok(WatchResult {
        stopped: true,
        stats,
    })
}
