//! Handler dispatch.
//!
//! The [`Dispatcher`] takes an issue event, resolves a handler by event name,
//! consults the ledger so a change is handled once, invokes the handler with a
//! [`HandlerContext`], and appends the outcome to the ledger. Handler errors
//! and panics become failed ledger entries; only ledger I/O is returned as an
//! error.

pub mod handlers;
pub mod mutation;

pub use handlers::{
    DirectoryResolver, FnHandler, Handler, HandlerRegistry, HandlerResolver, ScriptHandler,
};
pub use mutation::{
    CommandMutator, IssueUpdate, MutationRequest, MutationResult, Mutator, NewIssue, NoMutator,
};

use crate::diff::IssueEvent;
use crate::ledger::Ledger;
use crate::models::execution::{ExecutionRecord, ExecutionType, NewExecution, Trigger};
use crate::models::graph::{self, Readiness, ReadinessPolicy};
use crate::models::{Epic, EpicProgress, Issue};
use crate::storage::{IssueView, Snapshot};
use crate::{Error, Result};
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What makes two dispatches of the same event "the same change".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyScope {
    /// Any earlier success for (issue, event) counts
    Event,
    /// Only an earlier success for (issue, event, issue `updated_at`) counts
    #[default]
    Revision,
}

impl IdempotencyScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "event" => Some(IdempotencyScope::Event),
            "revision" => Some(IdempotencyScope::Revision),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyScope::Event => "event",
            IdempotencyScope::Revision => "revision",
        }
    }
}

impl fmt::Display for IdempotencyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot plus its readiness classification, shared by the query objects.
struct QueryIndex {
    snapshot: Arc<Snapshot>,
    readiness: Readiness,
}

impl QueryIndex {
    fn new(snapshot: Arc<Snapshot>, policy: ReadinessPolicy) -> Arc<Self> {
        let readiness = Readiness::classify_with(&snapshot, policy);
        Arc::new(Self {
            snapshot,
            readiness,
        })
    }
}

/// Read-only queries over the current snapshot, plus delegated mutations.
#[derive(Clone)]
pub struct IssueQuery {
    index: Arc<QueryIndex>,
    mutator: Arc<dyn Mutator>,
}

impl IssueQuery {
    /// All issues in ID order.
    pub fn list(&self) -> Vec<&Issue> {
        self.index.snapshot.issues().collect()
    }

    pub fn filter(&self, predicate: impl Fn(&Issue) -> bool) -> Vec<&Issue> {
        self.index
            .snapshot
            .issues()
            .filter(|issue| predicate(issue))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&Issue> {
        self.index.snapshot.get(id)
    }

    /// IDs of issues that depend on `id`.
    pub fn blocks(&self, id: &str) -> Vec<&str> {
        self.index.snapshot.blocks(id)
    }

    pub fn ready(&self) -> Vec<&Issue> {
        self.filter(|issue| self.index.readiness.is_ready(&issue.id))
    }

    pub fn blocked(&self) -> Vec<&Issue> {
        self.filter(|issue| self.index.readiness.is_blocked(&issue.id))
    }

    pub fn count(&self) -> usize {
        self.index.snapshot.len()
    }

    pub fn readiness(&self) -> &Readiness {
        &self.index.readiness
    }

    /// Ask the external tool to create an issue.
    pub async fn create(&self, issue: NewIssue) -> MutationResult {
        self.mutator.apply(MutationRequest::Create(issue)).await
    }

    pub async fn update(&self, update: IssueUpdate) -> MutationResult {
        self.mutator.apply(MutationRequest::Update(update)).await
    }

    pub async fn close(&self, id: &str, reason: Option<&str>) -> MutationResult {
        self.mutator
            .apply(MutationRequest::close(id, reason.map(str::to_string)))
            .await
    }
}

/// Read-only queries over epics in the current snapshot.
#[derive(Clone)]
pub struct EpicQuery {
    index: Arc<QueryIndex>,
}

impl EpicQuery {
    pub fn list(&self) -> Vec<Epic> {
        graph::epics(&self.index.snapshot)
    }

    pub fn get(&self, id: &str) -> Option<Epic> {
        self.list().into_iter().find(|epic| epic.issue.id == id)
    }

    pub fn children(&self, id: &str) -> Vec<&Issue> {
        graph::epic_children(&self.index.snapshot, id)
    }

    pub fn progress(&self, id: &str) -> Option<EpicProgress> {
        graph::epic_progress(&self.index.snapshot, id)
    }

    pub fn count(&self) -> usize {
        self.index.snapshot.issues().filter(|i| i.is_epic()).count()
    }
}

/// Everything a handler gets to see.
#[derive(Clone)]
pub struct HandlerContext {
    event: String,
    execution_type: ExecutionType,
    issue: Option<Issue>,
    previous: Option<Issue>,
    issues: IssueQuery,
    epics: EpicQuery,
    project_dir: PathBuf,
}

impl HandlerContext {
    /// Context for an issue event, with the default readiness policy.
    pub fn for_issue(
        event: &str,
        issue: Issue,
        previous: Option<Issue>,
        snapshot: Arc<Snapshot>,
    ) -> Self {
        Self::build(event, ExecutionType::Issue, Some(issue), previous, snapshot)
    }

    /// Context for a schedule firing; there is no affected issue.
    pub fn for_schedule(name: &str, snapshot: Arc<Snapshot>) -> Self {
        Self::build(name, ExecutionType::Schedule, None, None, snapshot)
    }

    fn build(
        event: &str,
        execution_type: ExecutionType,
        issue: Option<Issue>,
        previous: Option<Issue>,
        snapshot: Arc<Snapshot>,
    ) -> Self {
        let index = QueryIndex::new(snapshot, ReadinessPolicy::default());
        Self {
            event: event.to_string(),
            execution_type,
            issue,
            previous,
            issues: IssueQuery {
                index: index.clone(),
                mutator: Arc::new(NoMutator),
            },
            epics: EpicQuery { index },
            project_dir: PathBuf::from("."),
        }
    }

    pub fn with_execution_type(mut self, execution_type: ExecutionType) -> Self {
        self.execution_type = execution_type;
        self
    }

    /// Reclassify readiness under a different policy.
    pub fn with_policy(mut self, policy: ReadinessPolicy) -> Self {
        let index = QueryIndex::new(self.issues.index.snapshot.clone(), policy);
        self.issues.index = index.clone();
        self.epics.index = index;
        self
    }

    pub fn with_mutator(mut self, mutator: Arc<dyn Mutator>) -> Self {
        self.issues.mutator = mutator;
        self
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = dir.into();
        self
    }

    /// Event or schedule name.
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn execution_type(&self) -> ExecutionType {
        self.execution_type
    }

    /// The affected issue as of the current snapshot.
    pub fn issue(&self) -> Option<&Issue> {
        self.issue.as_ref()
    }

    /// State before the change, for updated, reopened, closed, ready and blocked events.
    pub fn previous(&self) -> Option<&Issue> {
        self.previous.as_ref()
    }

    pub fn issues(&self) -> &IssueQuery {
        &self.issues
    }

    pub fn epics(&self) -> &EpicQuery {
        &self.epics
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.issues.index.snapshot
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// JSON document handed to script handlers on stdin.
    pub fn payload(&self) -> serde_json::Value {
        let snapshot = self.snapshot();
        let readiness = self.issues.readiness();
        let epics: Vec<serde_json::Value> = self
            .epics
            .list()
            .into_iter()
            .map(|epic| {
                json!({
                    "id": epic.issue.id,
                    "title": epic.issue.title,
                    "progress": epic.progress,
                })
            })
            .collect();

        json!({
            "event": self.event,
            "type": self.execution_type,
            "revision": snapshot.revision(),
            "issue": self.issue.as_ref().map(|issue| IssueView {
                issue,
                blocks: snapshot.blocks(&issue.id),
            }),
            "previous": self.previous,
            "ready": readiness.ready().collect::<Vec<_>>(),
            "blocked": readiness.blocked().collect::<Vec<_>>(),
            "epics": epics,
        })
    }
}

/// What happened to one dispatch request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "record", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// No handler exists for the event; nothing was recorded
    NoHandler,
    /// The ledger already holds a success for this change
    AlreadyExecuted,
    Succeeded(ExecutionRecord),
    Failed(ExecutionRecord),
}

impl DispatchOutcome {
    pub fn record(&self) -> Option<&ExecutionRecord> {
        match self {
            DispatchOutcome::Succeeded(r) | DispatchOutcome::Failed(r) => Some(r),
            DispatchOutcome::NoHandler | DispatchOutcome::AlreadyExecuted => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DispatchOutcome::Failed(_))
    }
}

/// Matches events to handlers and records every invocation.
pub struct Dispatcher {
    ledger: Ledger,
    resolver: Arc<dyn HandlerResolver>,
    mutator: Arc<dyn Mutator>,
    scope: IdempotencyScope,
    policy: ReadinessPolicy,
    project_dir: PathBuf,
}

impl Dispatcher {
    pub fn new(ledger: Ledger, resolver: Arc<dyn HandlerResolver>) -> Self {
        Self {
            ledger,
            resolver,
            mutator: Arc::new(NoMutator),
            scope: IdempotencyScope::default(),
            policy: ReadinessPolicy::default(),
            project_dir: PathBuf::from("."),
        }
    }

    pub fn with_mutator(mut self, mutator: Arc<dyn Mutator>) -> Self {
        self.mutator = mutator;
        self
    }

    pub fn with_scope(mut self, scope: IdempotencyScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_policy(mut self, policy: ReadinessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = dir.into();
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Dispatch one detected event unless the ledger says it was handled.
    pub async fn dispatch(
        &self,
        event: &IssueEvent,
        snapshot: &Arc<Snapshot>,
        trigger: Trigger,
    ) -> Result<DispatchOutcome> {
        let name = event.kind.as_str();
        let Some(handler) = self.resolver.resolve(name) else {
            debug!(event = name, issue = %event.issue.id, "no handler");
            return Ok(DispatchOutcome::NoHandler);
        };

        if self.already_executed(&event.issue, name)? {
            debug!(event = name, issue = %event.issue.id, "already executed, skipping");
            return Ok(DispatchOutcome::AlreadyExecuted);
        }

        let ctx = self.context(HandlerContext::for_issue(
            name,
            event.issue.clone(),
            event.previous.clone(),
            snapshot.clone(),
        ));
        let entry = NewExecution::issue(
            &event.issue.id,
            name,
            handler.name(),
            trigger,
            snapshot.revision(),
        )
        .with_issue_updated_at(event.issue.updated_at);

        self.execute(handler, ctx, entry).await
    }

    /// Dispatch events one after another, in order.
    pub async fn dispatch_all(
        &self,
        events: &[IssueEvent],
        snapshot: &Arc<Snapshot>,
        trigger: Trigger,
    ) -> Result<Vec<DispatchOutcome>> {
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            outcomes.push(self.dispatch(event, snapshot, trigger).await?);
        }
        Ok(outcomes)
    }

    /// Run the handler for `event` against an issue regardless of the ledger.
    pub async fn trigger(
        &self,
        event: &str,
        issue_id: &str,
        snapshot: &Arc<Snapshot>,
    ) -> Result<DispatchOutcome> {
        let issue = lookup(snapshot, issue_id)?;
        let Some(handler) = self.resolver.resolve(event) else {
            return Ok(DispatchOutcome::NoHandler);
        };

        let ctx = self.context(
            HandlerContext::for_issue(event, issue.clone(), None, snapshot.clone())
                .with_execution_type(ExecutionType::Manual),
        );
        let entry = NewExecution::issue(
            issue_id,
            event,
            handler.name(),
            Trigger::Manual,
            snapshot.revision(),
        )
        .with_type(ExecutionType::Manual)
        .with_issue_updated_at(issue.updated_at);

        self.execute(handler, ctx, entry).await
    }

    /// Re-run the handler for the most recent failure of (issue, event).
    ///
    /// Returns `None` if the ledger has no failure for the pair.
    pub async fn retry(
        &self,
        issue_id: &str,
        event: &str,
        snapshot: &Arc<Snapshot>,
    ) -> Result<Option<DispatchOutcome>> {
        let Some(failure) = self.ledger.retry(issue_id, event)? else {
            return Ok(None);
        };
        let issue = lookup(snapshot, issue_id)?;
        let Some(handler) = self.resolver.resolve(event) else {
            return Ok(Some(DispatchOutcome::NoHandler));
        };
        if handler.name() != failure.handler {
            info!(
                previous = %failure.handler,
                current = handler.name(),
                "retrying with a different handler"
            );
        }

        let ctx = self.context(HandlerContext::for_issue(
            event,
            issue.clone(),
            None,
            snapshot.clone(),
        ));
        let entry = NewExecution::issue(
            issue_id,
            event,
            handler.name(),
            Trigger::Retry,
            snapshot.revision(),
        )
        .with_issue_updated_at(issue.updated_at);

        self.execute(handler, ctx, entry).await.map(Some)
    }

    /// Run the handler registered under a schedule name.
    pub async fn run_schedule(&self, name: &str, snapshot: &Arc<Snapshot>) -> Result<DispatchOutcome> {
        let Some(handler) = self.resolver.resolve(name) else {
            debug!(schedule = name, "no handler for schedule");
            return Ok(DispatchOutcome::NoHandler);
        };

        let ctx = self.context(HandlerContext::for_schedule(name, snapshot.clone()));
        let entry = NewExecution::schedule(name, handler.name(), snapshot.revision());
        self.execute(handler, ctx, entry).await
    }

    fn already_executed(&self, issue: &Issue, event: &str) -> Result<bool> {
        match self.scope {
            IdempotencyScope::Event => self.ledger.was_executed(&issue.id, event),
            IdempotencyScope::Revision => {
                self.ledger
                    .was_executed_at(&issue.id, event, issue.updated_at)
            }
        }
    }

    fn context(&self, ctx: HandlerContext) -> HandlerContext {
        ctx.with_policy(self.policy)
            .with_mutator(self.mutator.clone())
            .with_project_dir(self.project_dir.clone())
    }

    /// Invoke, time, and record. The ledger entry is written before returning.
    async fn execute(
        &self,
        handler: Arc<dyn Handler>,
        ctx: HandlerContext,
        entry: NewExecution,
    ) -> Result<DispatchOutcome> {
        let started = Instant::now();
        let result = invoke_isolated(handler.as_ref(), ctx).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let entry = entry.with_duration_ms(duration_ms);

        match result {
            Ok(()) => {
                let record = self.ledger.record(entry)?;
                info!(
                    handler = %record.handler,
                    issue = record.issue_id.as_deref().unwrap_or("-"),
                    duration_ms,
                    "handler succeeded"
                );
                Ok(DispatchOutcome::Succeeded(record))
            }
            Err(message) => {
                let record = self.ledger.record(entry.failed(&message))?;
                warn!(
                    handler = %record.handler,
                    issue = record.issue_id.as_deref().unwrap_or("-"),
                    error = %message,
                    "handler failed"
                );
                Ok(DispatchOutcome::Failed(record))
            }
        }
    }
}

fn lookup<'a>(snapshot: &'a Snapshot, issue_id: &str) -> Result<&'a Issue> {
    snapshot
        .get(issue_id)
        .ok_or_else(|| Error::NotFound(format!("Issue {} not found", issue_id)))
}

/// Run a handler, turning errors and panics into a message.
async fn invoke_isolated(handler: &dyn Handler, ctx: HandlerContext) -> std::result::Result<(), String> {
    let invocation = async move { handler.invoke(ctx).await };
    match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(Error::Handler(message))) => Err(message),
        Ok(Err(other)) => Err(other.to_string()),
        Err(panic) => Err(panic_message(panic)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::EventKind;
    use crate::models::execution::ExecutionStatus;
    use crate::models::{IssueKind, IssueStatus};
    use crate::test_utils::issue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        ledger: Ledger,
        calls: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let ledger = Ledger::new(dir.path().join("executions.jsonl"));
            Self {
                _dir: dir,
                ledger,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// A registry whose "created" handler counts calls and "closed" fails.
        fn registry(&self) -> HandlerRegistry {
            let mut registry = HandlerRegistry::new();
            let calls = self.calls.clone();
            registry.on_sync("created", move |_ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            registry.on("closed", |_ctx| async {
                Err(Error::Handler("could not notify".to_string()))
            });
            registry.on_sync("reopened", |_ctx| panic!("bad handler"));
            registry
        }

        fn dispatcher(&self, scope: IdempotencyScope) -> Dispatcher {
            Dispatcher::new(self.ledger.clone(), Arc::new(self.registry())).with_scope(scope)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn snapshot() -> Arc<Snapshot> {
        let mut epic = issue("bw-e", IssueStatus::Open, &[]);
        epic.kind = IssueKind::Epic;
        Arc::new(
            Snapshot::from_issues(vec![
                epic,
                issue("bw-1", IssueStatus::Open, &["bw-e"]),
                issue("bw-2", IssueStatus::Closed, &["bw-e"]),
                issue("bw-3", IssueStatus::Open, &["bw-1"]),
            ])
            .with_revision("rev-1"),
        )
    }

    fn created(id: &str) -> IssueEvent {
        IssueEvent::new(EventKind::Created, issue(id, IssueStatus::Open, &[]), None)
    }

    #[tokio::test]
    async fn test_missing_handler_is_not_dispatched() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(IdempotencyScope::Event);
        let event = IssueEvent::new(EventKind::Ready, issue("bw-1", IssueStatus::Open, &[]), None);

        let outcome = dispatcher.dispatch(&event, &snapshot(), Trigger::Watch).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::NoHandler);
        assert!(fx.ledger.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_is_recorded_once() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(IdempotencyScope::Event);
        let snap = snapshot();

        let first = dispatcher.dispatch(&created("bw-1"), &snap, Trigger::Watch).await.unwrap();
        let record = first.record().unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.handler, "created");
        assert_eq!(record.revision, "rev-1");
        assert_eq!(record.trigger, Trigger::Watch);

        let second = dispatcher.dispatch(&created("bw-1"), &snap, Trigger::Run).await.unwrap();
        assert_eq!(second, DispatchOutcome::AlreadyExecuted);
        assert_eq!(fx.calls(), 1);
        assert_eq!(fx.ledger.entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_revision_scope_reruns_new_revision() {
        let fx = Fixture::new();
        let snap = snapshot();
        let first = created("bw-1");
        let mut later = first.clone();
        later.issue.updated_at = first.issue.updated_at + chrono::Duration::seconds(1);

        let revision = fx.dispatcher(IdempotencyScope::Revision);
        revision.dispatch(&first, &snap, Trigger::Watch).await.unwrap();
        assert_eq!(
            revision.dispatch(&first, &snap, Trigger::Watch).await.unwrap(),
            DispatchOutcome::AlreadyExecuted
        );
        assert!(revision.dispatch(&later, &snap, Trigger::Watch).await.unwrap().record().is_some());

        let event_scope = fx.dispatcher(IdempotencyScope::Event);
        let mut latest = later.clone();
        latest.issue.updated_at = later.issue.updated_at + chrono::Duration::seconds(1);
        assert_eq!(
            event_scope.dispatch(&latest, &snap, Trigger::Watch).await.unwrap(),
            DispatchOutcome::AlreadyExecuted
        );
        assert_eq!(fx.calls(), 2);
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_recorded() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(IdempotencyScope::Revision);
        let snap = snapshot();
        let closed = IssueEvent::new(
            EventKind::Closed,
            issue("bw-2", IssueStatus::Closed, &[]),
            Some(issue("bw-2", IssueStatus::Open, &[])),
        );
        let reopened = IssueEvent::new(
            EventKind::Reopened,
            issue("bw-2", IssueStatus::Open, &[]),
            Some(issue("bw-2", IssueStatus::Closed, &[])),
        );

        let outcomes = dispatcher
            .dispatch_all(&[closed, reopened, created("bw-9")], &snap, Trigger::Watch)
            .await
            .unwrap();

        assert!(outcomes[0].is_failed());
        assert_eq!(
            outcomes[0].record().unwrap().error.as_deref(),
            Some("could not notify")
        );
        assert!(outcomes[1].is_failed());
        assert!(
            outcomes[1]
                .record()
                .unwrap()
                .error
                .as_deref()
                .unwrap()
                .contains("bad handler")
        );
        assert!(matches!(outcomes[2], DispatchOutcome::Succeeded(_)));
        assert_eq!(fx.ledger.list_failed().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_change_is_dispatched_again() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(IdempotencyScope::Event);
        let closed = IssueEvent::new(EventKind::Closed, issue("bw-2", IssueStatus::Closed, &[]), None);

        dispatcher.dispatch(&closed, &snapshot(), Trigger::Watch).await.unwrap();
        let again = dispatcher.dispatch(&closed, &snapshot(), Trigger::Watch).await.unwrap();
        assert!(again.is_failed());
        assert_eq!(fx.ledger.entries().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_manual_trigger_bypasses_ledger() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(IdempotencyScope::Event);
        let snap = snapshot();

        dispatcher.trigger("created", "bw-1", &snap).await.unwrap();
        let outcome = dispatcher.trigger("created", "bw-1", &snap).await.unwrap();
        let record = outcome.record().unwrap();
        assert_eq!(record.execution_type, ExecutionType::Manual);
        assert_eq!(record.trigger, Trigger::Manual);
        assert_eq!(fx.calls(), 2);

        assert!(matches!(
            dispatcher.trigger("created", "bw-404", &snap).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_uses_ledger_lookup() {
        let fx = Fixture::new();
        let snap = snapshot();
        let dispatcher = fx.dispatcher(IdempotencyScope::Event);
        assert!(dispatcher.retry("bw-2", "closed", &snap).await.unwrap().is_none());

        let closed = IssueEvent::new(EventKind::Closed, issue("bw-2", IssueStatus::Closed, &[]), None);
        dispatcher.dispatch(&closed, &snap, Trigger::Watch).await.unwrap();

        let outcome = dispatcher.retry("bw-2", "closed", &snap).await.unwrap().unwrap();
        let record = outcome.record().unwrap();
        assert_eq!(record.trigger, Trigger::Retry);
        assert_eq!(fx.ledger.entries().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_schedule_dispatch() {
        let fx = Fixture::new();
        let mut registry = fx.registry();
        registry.on_sync("nightly", |ctx| {
            assert!(ctx.issue().is_none());
            assert_eq!(ctx.execution_type(), ExecutionType::Schedule);
            Ok(())
        });
        let dispatcher = Dispatcher::new(fx.ledger.clone(), Arc::new(registry));

        let outcome = dispatcher.run_schedule("nightly", &snapshot()).await.unwrap();
        let record = outcome.record().unwrap();
        assert_eq!(record.execution_type, ExecutionType::Schedule);
        assert_eq!(record.schedule.as_deref(), Some("nightly"));
        assert_eq!(
            dispatcher.run_schedule("hourly", &snapshot()).await.unwrap(),
            DispatchOutcome::NoHandler
        );
    }

    #[test]
    fn test_context_queries() {
        let snap = snapshot();
        let ctx = HandlerContext::for_issue(
            "ready",
            snap.get("bw-1").cloned().unwrap(),
            None,
            snap.clone(),
        );

        let ids = |issues: Vec<&Issue>| issues.iter().map(|i| i.id.clone()).collect::<Vec<_>>();
        assert_eq!(ctx.issues().count(), 4);
        assert_eq!(ids(ctx.issues().ready()), vec!["bw-e"]);
        assert_eq!(ids(ctx.issues().blocked()), vec!["bw-1", "bw-3"]);
        assert_eq!(ctx.issues().blocks("bw-1"), vec!["bw-3"]);
        assert_eq!(ids(ctx.issues().filter(|i| i.is_closed())), vec!["bw-2"]);

        assert_eq!(ctx.epics().count(), 1);
        let progress = ctx.epics().progress("bw-e").unwrap();
        assert_eq!((progress.total, progress.closed), (2, 1));
        assert_eq!(ids(ctx.epics().children("bw-e")), vec!["bw-1", "bw-2"]);

        let lenient = ctx.clone().with_policy(ReadinessPolicy { epics_block: false });
        assert_eq!(ids(lenient.issues().ready()), vec!["bw-1", "bw-e"]);
    }

    #[test]
    fn test_payload_shape() {
        let snap = snapshot();
        let ctx = HandlerContext::for_issue("created", snap.get("bw-1").cloned().unwrap(), None, snap);
        let payload = ctx.payload();

        assert_eq!(payload["event"], "created");
        assert_eq!(payload["type"], "issue");
        assert_eq!(payload["revision"], "rev-1");
        assert_eq!(payload["issue"]["id"], "bw-1");
        assert_eq!(payload["issue"]["blocks"], json!(["bw-3"]));
        assert!(payload["previous"].is_null());
        assert_eq!(payload["ready"], json!(["bw-e"]));
        assert_eq!(payload["epics"][0]["progress"]["total"], 2);
    }

    #[tokio::test]
    async fn test_mutations_without_command_fail() {
        let ctx = HandlerContext::for_schedule("nightly", snapshot());
        let result = ctx.issues().close("bw-1", Some("done")).await;
        assert!(!result.success);
    }

    #[derive(Default)]
    struct RecordingMutator {
        requests: std::sync::Mutex<Vec<MutationRequest>>,
    }

    impl Mutator for RecordingMutator {
        fn apply(&self, request: MutationRequest) -> futures::future::BoxFuture<'_, MutationResult> {
            self.requests.lock().unwrap().push(request);
            Box::pin(async { MutationResult::succeeded(None) })
        }
    }

    #[tokio::test]
    async fn test_mutations_keep_their_kind() {
        let mutator = Arc::new(RecordingMutator::default());
        let ctx = HandlerContext::for_schedule("nightly", snapshot()).with_mutator(mutator.clone());

        assert!(ctx.issues().create(NewIssue::task("Follow up")).await.success);
        assert!(
            ctx.issues()
                .update(IssueUpdate::new("bw-1").with_status(IssueStatus::InProgress))
                .await
                .success
        );
        assert!(ctx.issues().close("bw-1", None).await.success);

        let requests = mutator.requests.lock().unwrap();
        assert!(matches!(&requests[0], MutationRequest::Create(issue) if issue.title == "Follow up"));
        assert!(matches!(&requests[1], MutationRequest::Update(update) if update.id == "bw-1"));
        assert!(matches!(&requests[2], MutationRequest::Close { id, .. } if id == "bw-1"));
    }

    #[test]
    fn test_scope_names() {
        assert_eq!(IdempotencyScope::parse("event"), Some(IdempotencyScope::Event));
        assert_eq!(IdempotencyScope::parse("revision"), Some(IdempotencyScope::Revision));
        assert_eq!(IdempotencyScope::parse("always"), None);
        assert_eq!(IdempotencyScope::default(), IdempotencyScope::Revision);
    }
}
