//! Handler capability and the two built-in ways of providing handlers.
//!
//! A handler is resolved by event (or schedule) name. [`DirectoryResolver`]
//! looks for an executable file named after the event in the handlers
//! directory; [`HandlerRegistry`] holds in-process closures registered by
//! library users.

use crate::dispatch::HandlerContext;
use crate::{Error, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Maximum number of stderr bytes kept in a failure message.
const STDERR_TAIL_BYTES: usize = 2000;

/// Code run in response to one named event.
///
/// Synchronous work is a handler whose future completes immediately.
pub trait Handler: Send + Sync {
    /// Identifier written to the ledger.
    fn name(&self) -> &str;

    fn invoke(&self, ctx: HandlerContext) -> BoxFuture<'_, Result<()>>;
}

/// Finds the handler for an event name, if there is one.
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, event: &str) -> Option<Arc<dyn Handler>>;
}

/// Resolves handlers from executable files in a directory.
///
/// A file matches event `E` when its stem is `E` (`created`, `closed.sh`,
/// `ready.py`). A missing directory resolves nothing.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    dir: PathBuf,
    timeout: Option<Duration>,
}

impl DirectoryResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All executable handler files, sorted by file name.
    pub fn scan(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.dir.display(), error = %e, "handlers directory not readable");
                return Vec::new();
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| is_executable(path))
            .collect();
        files.sort();
        files
    }
}

impl HandlerResolver for DirectoryResolver {
    fn resolve(&self, event: &str) -> Option<Arc<dyn Handler>> {
        let mut matches = self
            .scan()
            .into_iter()
            .filter(|path| path.file_stem().and_then(|s| s.to_str()) == Some(event));

        let path = matches.next()?;
        let ignored: Vec<PathBuf> = matches.collect();
        if !ignored.is_empty() {
            warn!(
                event,
                using = %path.display(),
                ignored = ignored.len(),
                "multiple handler files match event"
            );
        }
        Some(Arc::new(ScriptHandler::new(path).with_timeout(self.timeout)))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// Runs an executable file with the JSON context on stdin.
///
/// The process runs in the project directory with `BW_EVENT`, `BW_ISSUE_ID`
/// (when there is an issue) and `BW_PROJECT_DIR` set. A non-zero exit is a
/// failure whose message ends with the tail of stderr.
#[derive(Debug, Clone)]
pub struct ScriptHandler {
    path: PathBuf,
    name: String,
    timeout: Option<Duration>,
}

impl ScriptHandler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            path,
            name,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run(&self, ctx: HandlerContext) -> Result<()> {
        let payload = serde_json::to_vec(&ctx.payload())?;

        let mut cmd = tokio::process::Command::new(&self.path);
        cmd.current_dir(ctx.project_dir())
            .env("BW_EVENT", ctx.event())
            .env("BW_PROJECT_DIR", ctx.project_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(issue) = ctx.issue() {
            cmd.env("BW_ISSUE_ID", &issue.id);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Handler(format!("failed to start {}: {}", self.name, e)))?;

        // Feed stdin while waiting so a handler that never reads it cannot stall us.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "handler closed stdin early");
                }
            }
        };
        let wait = async {
            let (_, output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                Error::Handler(format!("{} timed out after {:?}", self.name, limit))
            })?,
            None => wait.await,
        }
        .map_err(|e| Error::Handler(format!("failed to wait for {}: {}", self.name, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(handler = %self.name, output = %stdout.trim(), "handler output");
        }

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Handler(failure_message(
                &output.status,
                &String::from_utf8_lossy(&output.stderr),
            )))
        }
    }
}

impl Handler for ScriptHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, ctx: HandlerContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.run(ctx))
    }
}

fn failure_message(status: &std::process::ExitStatus, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        return format!("exited with {}", status);
    }
    let mut start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    while !stderr.is_char_boundary(start) {
        start += 1;
    }
    format!("exited with {}: {}", status, &stderr[start..])
}

type BoxedFn = dyn Fn(HandlerContext) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// An in-process handler built from a closure.
pub struct FnHandler {
    name: String,
    f: Box<BoxedFn>,
}

impl FnHandler {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(move |ctx| -> BoxFuture<'static, Result<()>> { Box::pin(f(ctx)) }),
        }
    }

    /// Wrap a synchronous closure as a handler that completes immediately.
    pub fn sync<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&HandlerContext) -> Result<()> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(name, move |ctx| {
            let f = f.clone();
            async move { f(&ctx) }
        })
    }
}

impl Handler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, ctx: HandlerContext) -> BoxFuture<'_, Result<()>> {
        // Call inside the future so a panicking closure is caught by the dispatcher.
        Box::pin(async move { (self.f)(ctx).await })
    }
}

/// In-process handlers keyed by event or schedule name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `event`, replacing any previous one.
    pub fn register(&mut self, event: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(event.into(), Arc::new(handler));
    }

    /// Register an async closure.
    pub fn on<F, Fut>(&mut self, event: &str, f: F)
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(event, FnHandler::new(event, f));
    }

    /// Register a synchronous closure.
    pub fn on_sync<F>(&mut self, event: &str, f: F)
    where
        F: Fn(&HandlerContext) -> Result<()> + Send + Sync + 'static,
    {
        self.register(event, FnHandler::sync(event, f));
    }

    pub fn events(&self) -> Vec<&str> {
        let mut events: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        events.sort_unstable();
        events
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, event: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(event).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::EventKind;
    use crate::models::IssueStatus;
    use crate::storage::Snapshot;
    use crate::test_utils::issue;
    use tempfile::TempDir;

    fn context(dir: &Path) -> HandlerContext {
        let snapshot = Arc::new(Snapshot::from_issues(vec![issue(
            "bw-1",
            IssueStatus::Open,
            &[],
        )]));
        HandlerContext::for_issue(
            EventKind::Created.as_str(),
            snapshot.get("bw-1").cloned().unwrap(),
            None,
            snapshot,
        )
        .with_project_dir(dir)
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_missing_directory_resolves_nothing() {
        let resolver = DirectoryResolver::new("/nonexistent/bellwether/handlers");
        assert!(resolver.resolve("created").is_none());
        assert!(resolver.scan().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolves_by_file_stem() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "closed.sh", "exit 0");
        fs::write(dir.path().join("created.sh"), "#!/bin/sh\n").unwrap();

        let resolver = DirectoryResolver::new(dir.path());
        let handler = resolver.resolve("closed").unwrap();
        assert_eq!(handler.name(), "closed.sh");
        // Not executable
        assert!(resolver.resolve("created").is_none());
        assert!(resolver.resolve("clos").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_receives_context() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("seen.json");
        let script = write_script(
            dir.path(),
            "created",
            &format!(
                "cat > {}\necho \"$BW_EVENT $BW_ISSUE_ID\" >> {}",
                out.display(),
                out.display()
            ),
        );

        ScriptHandler::new(script)
            .invoke(context(dir.path()))
            .await
            .unwrap();

        let seen = fs::read_to_string(&out).unwrap();
        assert!(seen.contains("\"id\":\"bw-1\""));
        assert!(seen.trim_end().ends_with("created bw-1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_failure_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "created", "echo 'no luck' >&2\nexit 3");

        let err = ScriptHandler::new(script)
            .invoke(context(dir.path()))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("no luck"), "{}", message);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_timeout() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "created", "sleep 5");

        let err = ScriptHandler::new(script)
            .with_timeout(Some(Duration::from_millis(100)))
            .invoke(context(dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out after 100ms"));
    }

    #[tokio::test]
    async fn test_registry_sync_and_async() {
        let mut registry = HandlerRegistry::new();
        registry.on_sync("created", |ctx| {
            assert_eq!(ctx.event(), "created");
            Ok(())
        });
        registry.on("closed", |_ctx| async { Err(Error::Handler("nope".to_string())) });

        assert_eq!(registry.events(), vec!["closed", "created"]);
        let dir = TempDir::new().unwrap();

        let created = registry.resolve("created").unwrap();
        assert_eq!(created.name(), "created");
        assert!(created.invoke(context(dir.path())).await.is_ok());

        let closed = registry.resolve("closed").unwrap();
        assert!(closed.invoke(context(dir.path())).await.is_err());
        assert!(registry.resolve("ready").is_none());
    }

    #[test]
    fn test_failure_message_tail() {
        let status = std::process::Command::new("sh")
            .args(["-c", "exit 1"])
            .status();
        let Ok(status) = status else {
            return;
        };
        let long = "x".repeat(STDERR_TAIL_BYTES * 2);
        let message = failure_message(&status, &long);
        assert!(message.len() < STDERR_TAIL_BYTES + 50);
        assert_eq!(failure_message(&status, "  "), format!("exited with {}", status));
    }
}
