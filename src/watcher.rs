//! Live watcher for the issue log.
//!
//! Two independent sources schedule reconciliation passes: a native file
//! system subscription on the storage directory (best effort) and a fixed
//! interval poll of the log size. Triggers are debounced, and passes run one
//! at a time on a single task, so triggers that arrive during a pass collapse
//! into exactly one further pass.

use crate::diff::{DetectOptions, IssueEvent, detect_events};
use crate::storage::{Snapshot, Storage};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);
/// Default interval between log size polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
/// A burst of triggers defers a pass by at most this many debounce windows.
const MAX_DEFERRAL_WINDOWS: u32 = 4;

/// Watcher tuning.
#[derive(Debug, Clone, Copy)]
pub struct WatchConfig {
    /// Quiet period after the last trigger before a pass runs. A steady
    /// stream of triggers still gets a pass every few windows.
    pub debounce: Duration,
    /// How often the log size is polled
    pub poll_interval: Duration,
    /// Whether to subscribe to native file system notifications
    pub native_notifications: bool,
    pub detect: DetectOptions,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            native_notifications: true,
            detect: DetectOptions::default(),
        }
    }
}

/// Summary emitted after every completed reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Pass number since the watcher was created
    pub pass: u64,
    /// Number of issue events emitted by this pass
    pub changes: usize,
    /// The log shrank; the new content was adopted without diffing
    pub truncated: bool,
    pub revision: String,
    pub completed_at: DateTime<Utc>,
}

/// Output of the watcher.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// One changed issue, with the snapshot it was detected in
    Issue {
        event: IssueEvent,
        snapshot: Arc<Snapshot>,
    },
    /// A pass finished, whether or not anything changed
    Reconciled(Reconciliation),
}

/// Lifecycle state of a [`Watcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Running,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<u64>,
    current: watch::Receiver<Arc<Snapshot>>,
    native: Option<RecommendedWatcher>,
}

/// Turns issue log mutations into a stream of [`WatchEvent`]s.
pub struct Watcher {
    storage: Storage,
    config: WatchConfig,
    events: mpsc::UnboundedSender<WatchEvent>,
    passes: u64,
    running: Option<Running>,
}

impl Watcher {
    pub fn new(
        storage: Storage,
        config: WatchConfig,
        events: mpsc::UnboundedSender<WatchEvent>,
    ) -> Self {
        Self {
            storage,
            config,
            events,
            passes: 0,
            running: None,
        }
    }

    pub fn state(&self) -> WatcherState {
        if self.running.is_some() {
            WatcherState::Running
        } else {
            WatcherState::Stopped
        }
    }

    /// The snapshot the watcher currently diffs against, if running.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.running.as_ref().map(|r| r.current.borrow().clone())
    }

    /// Load a fresh baseline and arm both notification sources.
    ///
    /// Fails if the issue log cannot be read. Calling `start` while running is
    /// a no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let baseline = load(self.storage.clone()).await?;
        info!(
            issues = baseline.len(),
            revision = %baseline.revision(),
            "watcher started"
        );

        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let native = if self.config.native_notifications {
            arm_native(&self.storage, trigger_tx.clone())
        } else {
            None
        };

        let baseline = Arc::new(baseline);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (current_tx, current_rx) = watch::channel(baseline.clone());

        let reconciler = Reconciler {
            storage: self.storage.clone(),
            config: self.config,
            events: self.events.clone(),
            baseline,
            current: current_tx,
            passes: self.passes,
            _trigger_tx: trigger_tx,
            #[cfg(test)]
            pass_delay: Duration::ZERO,
        };
        let task = tokio::spawn(reconciler.run(trigger_rx, shutdown_rx));

        self.running = Some(Running {
            shutdown: shutdown_tx,
            task,
            current: current_rx,
            native,
        });
        Ok(())
    }

    /// Release both notification sources and wait for an in-flight pass.
    ///
    /// No pass starts after this returns. Stopping a stopped watcher is a no-op.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        drop(running.native);
        let _ = running.shutdown.send(true);
        match running.task.await {
            Ok(passes) => self.passes = passes,
            Err(e) => error!(error = %e, "reconciliation task ended abnormally"),
        }
        info!("watcher stopped");
    }
}

/// Owns the baseline and runs passes; lives on a single task.
struct Reconciler {
    storage: Storage,
    config: WatchConfig,
    events: mpsc::UnboundedSender<WatchEvent>,
    baseline: Arc<Snapshot>,
    current: watch::Sender<Arc<Snapshot>>,
    passes: u64,
    // Keeps the trigger channel open when native notifications are off.
    _trigger_tx: mpsc::Sender<()>,
    #[cfg(test)]
    pass_delay: Duration,
}

impl Reconciler {
    async fn run(
        mut self,
        mut triggers: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) -> u64 {
        let log_path = self.storage.issues_path();
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut observed_len = self.baseline.source_len();
        let max_deferral = self.config.debounce * MAX_DEFERRAL_WINDOWS;
        // First and latest trigger of the current burst.
        let mut burst: Option<(Instant, Instant)> = None;

        loop {
            let wait = match burst {
                Some((first, last)) => {
                    let quiet = self.config.debounce.saturating_sub(last.elapsed());
                    let cap = max_deferral.saturating_sub(first.elapsed());
                    quiet.min(cap)
                }
                None => Duration::ZERO,
            };

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(()) = triggers.recv() => {
                    burst = Some(extend_burst(burst));
                }
                _ = poll.tick() => {
                    if let Some(len) = file_len(&log_path).await {
                        if len != observed_len {
                            observed_len = len;
                            burst = Some(extend_burst(burst));
                        }
                    }
                }
                _ = tokio::time::sleep(wait), if burst.is_some() => {
                    burst = None;
                    if *shutdown.borrow() {
                        break;
                    }
                    self.reconcile().await;
                    observed_len = self.baseline.source_len();
                }
            }
        }

        self.passes
    }

    /// One pass: re-read, diff against the baseline, emit, replace the baseline.
    async fn reconcile(&mut self) {
        let snapshot = match load(self.storage.clone()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "reconciliation could not read issue log");
                return;
            }
        };
        self.passes += 1;

        #[cfg(test)]
        tokio::time::sleep(self.pass_delay).await;

        for (issue, dep) in snapshot.dangling_dependencies() {
            debug!(issue, dependency = dep, "dependency not present in snapshot");
        }

        let truncated = snapshot.source_len() < self.baseline.source_len();
        let snapshot = Arc::new(snapshot);
        let mut changes = 0;

        if truncated {
            info!(
                previous_len = self.baseline.source_len(),
                new_len = snapshot.source_len(),
                "issue log shrank, adopting it as the new baseline"
            );
        } else {
            let events = detect_events(&self.baseline, &snapshot, self.config.detect);
            changes = events.len();
            for event in events {
                debug!(issue = %event.issue.id, event = %event.kind, "issue event");
                let _ = self.events.send(WatchEvent::Issue {
                    event,
                    snapshot: snapshot.clone(),
                });
            }
        }

        self.baseline = snapshot.clone();
        let _ = self.current.send(snapshot.clone());

        debug!(pass = self.passes, changes, truncated, "reconciliation complete");
        let _ = self.events.send(WatchEvent::Reconciled(Reconciliation {
            pass: self.passes,
            changes,
            truncated,
            revision: snapshot.revision().to_string(),
            completed_at: Utc::now(),
        }));
    }
}

fn extend_burst(burst: Option<(Instant, Instant)>) -> (Instant, Instant) {
    let now = Instant::now();
    match burst {
        Some((first, _)) => (first, now),
        None => (now, now),
    }
}

/// Read the log off the async thread.
async fn load(storage: Storage) -> Result<Snapshot> {
    tokio::task::spawn_blocking(move || storage.load_snapshot())
        .await
        .map_err(|e| Error::Other(format!("snapshot reader failed: {}", e)))?
}

async fn file_len(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Some(meta.len()),
        Err(e) => {
            debug!(error = %e, "could not stat issue log");
            None
        }
    }
}

/// Subscribe to native notifications for the storage directory.
///
/// Returns `None` (polling only) if the platform mechanism is unavailable.
fn arm_native(storage: &Storage, trigger: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
    let log_name: Option<OsString> = storage.issues_path().file_name().map(OsString::from);

    let result = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else {
                return;
            };
            let relevant_kind = matches!(
                event.kind,
                notify::EventKind::Create(_)
                    | notify::EventKind::Modify(_)
                    | notify::EventKind::Remove(_)
            );
            let relevant_path = event.paths.is_empty()
                || event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(OsString::from) == log_name);
            if relevant_kind && relevant_path {
                // A full channel already holds a pending trigger.
                let _ = trigger.try_send(());
            }
        },
        notify::Config::default(),
    )
    .and_then(|mut watcher| {
        watcher.watch(storage.root(), RecursiveMode::NonRecursive)?;
        Ok(watcher)
    });

    match result {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "native file notifications unavailable, polling only");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::EventKind;
    use crate::models::IssueStatus;
    use crate::storage::ISSUES_FILE;
    use crate::test_utils::{TestEnv, issue};
    use std::fs;

    fn fast_config(native: bool) -> WatchConfig {
        WatchConfig {
            debounce: Duration::from_millis(100),
            poll_interval: Duration::from_millis(30),
            native_notifications: native,
            detect: DetectOptions::default(),
        }
    }

    /// Collect events until `dur` of silence has passed.
    async fn drain(rx: &mut mpsc::UnboundedReceiver<WatchEvent>, dur: Duration) -> Vec<WatchEvent> {
        let mut out = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(dur, rx.recv()).await {
            out.push(event);
        }
        out
    }

    fn issue_events(events: &[WatchEvent]) -> Vec<(EventKind, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                WatchEvent::Issue { event, .. } => Some((event.kind, event.issue.id.clone())),
                WatchEvent::Reconciled(_) => None,
            })
            .collect()
    }

    fn reconciliations(events: &[WatchEvent]) -> Vec<&Reconciliation> {
        events
            .iter()
            .filter_map(|e| match e {
                WatchEvent::Reconciled(r) => Some(r),
                WatchEvent::Issue { .. } => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_detects_created_issue() {
        let env = TestEnv::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = Watcher::new(env.storage(), fast_config(false), tx);
        watcher.start().await.unwrap();
        assert_eq!(watcher.state(), WatcherState::Running);

        env.append(&issue("bw-1", IssueStatus::Open, &[]));
        let events = drain(&mut rx, Duration::from_millis(600)).await;

        assert_eq!(issue_events(&events), vec![(EventKind::Created, "bw-1".to_string())]);
        assert_eq!(reconciliations(&events).len(), 1);
        assert!(watcher.snapshot().unwrap().contains("bw-1"));
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_native_notifications_detect_changes() {
        let env = TestEnv::new();
        env.append(&issue("bw-1", IssueStatus::Open, &[]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = Watcher::new(env.storage(), fast_config(true), tx);
        watcher.start().await.unwrap();

        env.append(&issue("bw-1", IssueStatus::Closed, &[]));
        let events = drain(&mut rx, Duration::from_millis(600)).await;

        assert_eq!(issue_events(&events), vec![(EventKind::Closed, "bw-1".to_string())]);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_rapid_appends_are_debounced() {
        let env = TestEnv::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = Watcher::new(env.storage(), fast_config(true), tx);
        watcher.start().await.unwrap();

        for n in 1..=5 {
            env.append(&issue(&format!("bw-{}", n), IssueStatus::Open, &[]));
        }
        let events = drain(&mut rx, Duration::from_millis(800)).await;

        let passes = reconciliations(&events).len();
        assert!(passes >= 1 && passes < 5, "expected debounced passes, got {}", passes);
        assert_eq!(issue_events(&events).len(), 5);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_steady_writes_still_reconcile() {
        let env = TestEnv::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = Watcher::new(env.storage(), fast_config(true), tx);
        watcher.start().await.unwrap();

        // Appends land faster than the debounce window for well over its cap.
        for n in 1..=12 {
            env.append(&issue(&format!("bw-{}", n), IssueStatus::Open, &[]));
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        let mut during = Vec::new();
        while let Ok(event) = rx.try_recv() {
            during.push(event);
        }
        assert!(
            !reconciliations(&during).is_empty(),
            "no pass ran while the log was being written"
        );

        let after = drain(&mut rx, Duration::from_millis(600)).await;
        let created = issue_events(&during).len() + issue_events(&after).len();
        assert_eq!(created, 12);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_trigger_during_pass_runs_one_more_pass() {
        let env = TestEnv::new();
        let storage = env.storage();
        let baseline = Arc::new(storage.load_snapshot().unwrap());
        let (events_tx, mut rx) = mpsc::unbounded_channel();
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (current_tx, _current_rx) = watch::channel(baseline.clone());

        let reconciler = Reconciler {
            storage,
            config: WatchConfig {
                debounce: Duration::from_millis(50),
                poll_interval: Duration::from_secs(10),
                native_notifications: false,
                detect: DetectOptions::default(),
            },
            events: events_tx,
            baseline,
            current: current_tx,
            passes: 0,
            _trigger_tx: trigger_tx.clone(),
            pass_delay: Duration::from_millis(300),
        };
        let task = tokio::spawn(reconciler.run(trigger_rx, shutdown_rx));

        env.append(&issue("bw-1", IssueStatus::Open, &[]));
        trigger_tx.send(()).await.unwrap();

        // The first pass has read the log and is still running.
        tokio::time::sleep(Duration::from_millis(150)).await;
        env.append(&issue("bw-2", IssueStatus::Open, &[]));
        for _ in 0..3 {
            let _ = trigger_tx.try_send(());
        }

        let events = drain(&mut rx, Duration::from_millis(800)).await;
        assert_eq!(reconciliations(&events).len(), 2);
        assert_eq!(
            issue_events(&events),
            vec![
                (EventKind::Created, "bw-1".to_string()),
                (EventKind::Created, "bw-2".to_string()),
            ]
        );

        shutdown_tx.send(true).unwrap();
        assert_eq!(task.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_restart_does_not_replay() {
        let env = TestEnv::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = Watcher::new(env.storage(), fast_config(false), tx);

        watcher.start().await.unwrap();
        env.append(&issue("bw-1", IssueStatus::Open, &[]));
        let first = drain(&mut rx, Duration::from_millis(600)).await;
        assert_eq!(issue_events(&first), vec![(EventKind::Created, "bw-1".to_string())]);

        watcher.stop().await;
        watcher.stop().await;
        assert_eq!(watcher.state(), WatcherState::Stopped);
        assert!(watcher.snapshot().is_none());

        env.append(&issue("bw-2", IssueStatus::Open, &[]));
        assert!(drain(&mut rx, Duration::from_millis(300)).await.is_empty());

        watcher.start().await.unwrap();
        env.append(&issue("bw-3", IssueStatus::Open, &[]));
        let second = drain(&mut rx, Duration::from_millis(600)).await;
        assert_eq!(issue_events(&second), vec![(EventKind::Created, "bw-3".to_string())]);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_truncation_adopts_new_baseline() {
        let env = TestEnv::new();
        env.append(&issue("bw-1", IssueStatus::Open, &[]));
        env.append(&issue("bw-2", IssueStatus::Open, &[]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = Watcher::new(env.storage(), fast_config(false), tx);
        watcher.start().await.unwrap();

        let compacted = serde_json::to_string(&issue("bw-9", IssueStatus::Open, &[])).unwrap();
        fs::write(env.storage_path().join(ISSUES_FILE), format!("{}\n", compacted)).unwrap();
        let events = drain(&mut rx, Duration::from_millis(600)).await;

        assert!(issue_events(&events).is_empty());
        let passes = reconciliations(&events);
        assert_eq!(passes.len(), 1);
        assert!(passes[0].truncated);
        assert!(watcher.snapshot().unwrap().contains("bw-9"));

        env.append(&issue("bw-10", IssueStatus::Open, &[]));
        let events = drain(&mut rx, Duration::from_millis(600)).await;
        assert_eq!(issue_events(&events), vec![(EventKind::Created, "bw-10".to_string())]);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_start_fails_without_log() {
        let env = TestEnv::new();
        fs::remove_file(env.storage_path().join(ISSUES_FILE)).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut watcher = Watcher::new(env.storage(), fast_config(false), tx);

        assert!(matches!(watcher.start().await, Err(Error::LogMissing(_))));
        assert_eq!(watcher.state(), WatcherState::Stopped);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_unchanged_rewrite_still_reconciles() {
        let env = TestEnv::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = Watcher::new(env.storage(), fast_config(false), tx);
        watcher.start().await.unwrap();

        env.append_raw("not an issue");
        let events = drain(&mut rx, Duration::from_millis(600)).await;
        let passes = reconciliations(&events);
        assert_eq!(passes.len(), 1);
        assert_eq!(passes[0].changes, 0);
        assert!(issue_events(&events).is_empty());
        watcher.stop().await;
    }
}
