//! Long-running watch mode.
//!
//! The daemon owns a [`Watcher`], a [`Dispatcher`] and a [`Scheduler`]. Issue
//! events and due schedules are handled one at a time by a single dispatch
//! task, so a slow handler delays later dispatches but never the watcher's
//! notification plumbing.

use crate::diff::IssueEvent;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::models::execution::Trigger;
use crate::scheduler::Scheduler;
use crate::storage::{Snapshot, Storage};
use crate::watcher::{WatchConfig, WatchEvent, Watcher};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Counters reported when the daemon stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStats {
    /// Completed reconciliation passes
    pub passes: u64,
    /// Issue events received from the watcher
    pub events: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Events skipped because the ledger already had a success
    pub skipped: u64,
    pub schedules_fired: u64,
}

impl DaemonStats {
    fn count(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Succeeded(_) => self.succeeded += 1,
            DispatchOutcome::Failed(_) => self.failed += 1,
            DispatchOutcome::AlreadyExecuted => self.skipped += 1,
            DispatchOutcome::NoHandler => {}
        }
    }
}

struct Running {
    watcher: Watcher,
    shutdown: watch::Sender<bool>,
    dispatch_task: JoinHandle<DaemonStats>,
    scheduler_task: Option<JoinHandle<()>>,
}

/// Watcher, dispatcher and scheduler wired together.
pub struct Daemon {
    storage: Storage,
    watch_config: WatchConfig,
    dispatcher: Arc<Dispatcher>,
    scheduler: Scheduler,
    running: Option<Running>,
}

impl Daemon {
    pub fn new(
        storage: Storage,
        watch_config: WatchConfig,
        dispatcher: Dispatcher,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            storage,
            watch_config,
            dispatcher: Arc::new(dispatcher),
            scheduler,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start watching and dispatching. A no-op if already running.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut watcher = Watcher::new(self.storage.clone(), self.watch_config, events_tx);
        watcher.start().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let scheduler_task = self.scheduler.spawn(due_tx, shutdown_rx.clone());

        let dispatch_loop = DispatchLoop {
            storage: self.storage.clone(),
            dispatcher: self.dispatcher.clone(),
            stats: DaemonStats::default(),
        };
        let dispatch_task = tokio::spawn(dispatch_loop.run(events_rx, due_rx, shutdown_rx));

        info!(root = %self.storage.root().display(), "daemon started");
        self.running = Some(Running {
            watcher,
            shutdown: shutdown_tx,
            dispatch_task,
            scheduler_task,
        });
        Ok(())
    }

    /// Stop everything, letting in-flight work finish.
    ///
    /// Nothing new is reconciled or dispatched once this returns. Events still
    /// queued at that point are dropped. Stopping a stopped daemon returns
    /// empty stats.
    pub async fn stop(&mut self) -> DaemonStats {
        let Some(mut running) = self.running.take() else {
            return DaemonStats::default();
        };

        running.watcher.stop().await;
        let _ = running.shutdown.send(true);

        let stats = match running.dispatch_task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "dispatch task ended abnormally");
                DaemonStats::default()
            }
        };
        if let Some(task) = running.scheduler_task {
            if let Err(e) = task.await {
                error!(error = %e, "scheduler task ended abnormally");
            }
        }

        info!(
            passes = stats.passes,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "daemon stopped"
        );
        stats
    }
}

struct DispatchLoop {
    storage: Storage,
    dispatcher: Arc<Dispatcher>,
    stats: DaemonStats,
}

impl DispatchLoop {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
        mut due: mpsc::UnboundedReceiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) -> DaemonStats {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(event) = events.recv() => match event {
                    WatchEvent::Issue { event, snapshot } => {
                        self.stats.events += 1;
                        self.dispatch(&event, &snapshot).await;
                    }
                    WatchEvent::Reconciled(summary) => {
                        self.stats.passes += 1;
                        debug!(pass = summary.pass, changes = summary.changes, "pass complete");
                    }
                },
                Some(name) = due.recv() => {
                    self.stats.schedules_fired += 1;
                    self.run_schedule(&name).await;
                }
                else => break,
            }
        }
        self.stats
    }

    async fn dispatch(&mut self, event: &IssueEvent, snapshot: &Arc<Snapshot>) {
        match self.dispatcher.dispatch(event, snapshot, Trigger::Watch).await {
            Ok(outcome) => self.stats.count(&outcome),
            Err(e) => error!(
                issue = %event.issue.id,
                event = %event.kind,
                error = %e,
                "could not record execution"
            ),
        }
    }

    async fn run_schedule(&mut self, name: &str) {
        let storage = self.storage.clone();
        let snapshot = match tokio::task::spawn_blocking(move || storage.load_snapshot()).await {
            Ok(Ok(snapshot)) => Arc::new(snapshot),
            Ok(Err(e)) => {
                error!(schedule = name, error = %e, "could not read issue log for schedule");
                return;
            }
            Err(e) => {
                error!(schedule = name, error = %Error::Other(e.to_string()), "snapshot reader failed");
                return;
            }
        };

        match self.dispatcher.run_schedule(name, &snapshot).await {
            Ok(outcome) => self.stats.count(&outcome),
            Err(e) => error!(schedule = name, error = %e, "could not record execution"),
        }
    }
}
