//! Precedence resolution for configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. CLI flags (passed at runtime)
//! 2. Project config.kdl (`<project>/.bellwether/config.kdl`)
//! 3. System config.kdl (`$BW_CONFIG_DIR/config.kdl` or `~/.config/bellwether/config.kdl`)
//! 4. Built-in defaults
//!
//! Schedules are merged by name across both files, project entries winning.

use crate::config::schema::{BellwetherConfig, ScheduleConfig};
use crate::config::system_config_path;
use crate::diff::{DetectOptions, DiffOptions};
use crate::dispatch::IdempotencyScope;
use crate::models::graph::ReadinessPolicy;
use crate::scheduler::{ScheduleRegistry, parse_duration};
use crate::storage::Storage;
use crate::watcher::WatchConfig;
use crate::{Error, Result};
use kdl::KdlDocument;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default debounce window in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 250;
/// Default poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
/// Default handlers directory, relative to the `.bellwether/` directory.
pub const DEFAULT_HANDLERS_DIR: &str = "handlers";

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// Value from CLI flag
    CliFlag,
    /// Value from the project's config.kdl
    Project,
    /// Value from the system config.kdl
    System,
    /// Built-in default value
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::CliFlag => write!(f, "cli"),
            ValueSource::Project => write!(f, "project"),
            ValueSource::System => write!(f, "system"),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

impl Serialize for ValueSource {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone, Serialize)]
pub struct Resolved<T> {
    /// The resolved value
    pub value: T,
    /// Where the value came from
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    /// Create a new resolved value.
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// Fully resolved configuration with source tracking.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub debounce_ms: Resolved<u64>,
    pub poll_interval_ms: Resolved<u64>,
    /// Absolute handlers directory
    pub handlers_dir: Resolved<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_timeout_secs: Option<Resolved<u64>>,
    pub label_changes: Resolved<bool>,
    pub epics_block_children: Resolved<bool>,
    pub idempotency: Resolved<IdempotencyScope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutation_command: Option<Resolved<String>>,
    pub schedules: Vec<Resolved<ScheduleConfig>>,
}

impl ResolvedConfig {
    /// Defaults for the storage directory `storage_root`.
    pub fn defaults(storage_root: &Path) -> Self {
        Self {
            debounce_ms: Resolved::new(DEFAULT_DEBOUNCE_MS, ValueSource::Default),
            poll_interval_ms: Resolved::new(DEFAULT_POLL_INTERVAL_MS, ValueSource::Default),
            handlers_dir: Resolved::new(
                storage_root.join(DEFAULT_HANDLERS_DIR),
                ValueSource::Default,
            ),
            handler_timeout_secs: None,
            label_changes: Resolved::new(false, ValueSource::Default),
            epics_block_children: Resolved::new(true, ValueSource::Default),
            idempotency: Resolved::new(IdempotencyScope::default(), ValueSource::Default),
            mutation_command: None,
            schedules: Vec::new(),
        }
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            debounce: Duration::from_millis(self.debounce_ms.value),
            poll_interval: Duration::from_millis(self.poll_interval_ms.value),
            native_notifications: true,
            detect: self.detect_options(),
        }
    }

    pub fn detect_options(&self) -> DetectOptions {
        DetectOptions {
            diff: DiffOptions {
                labels_count: self.label_changes.value,
            },
            readiness: self.readiness_policy(),
        }
    }

    pub fn readiness_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            epics_block: self.epics_block_children.value,
        }
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_secs
            .as_ref()
            .map(|r| Duration::from_secs(r.value))
    }

    pub fn mutation_command(&self) -> Option<&str> {
        self.mutation_command.as_ref().map(|r| r.value.as_str())
    }

    /// Build the schedule registry from the configured schedules.
    pub fn schedule_registry(&self) -> Result<ScheduleRegistry> {
        let mut registry = ScheduleRegistry::new();
        for schedule in &self.schedules {
            let every = parse_duration(&schedule.value.every)?;
            registry.register(schedule.value.name.clone(), every)?;
        }
        Ok(registry)
    }
}

/// CLI overrides for configuration resolution.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub debounce_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub handlers_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create empty overrides.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = Some(ms);
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = Some(ms);
        self
    }

    pub fn with_handlers_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.handlers_dir = Some(dir.into());
        self
    }
}

/// Read and validate a config.kdl. A missing file is an empty config.
pub fn read_config_file(path: &Path) -> Result<BellwetherConfig> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BellwetherConfig::new()),
        Err(e) => return Err(Error::Io(e)),
    };

    let doc: KdlDocument = content
        .parse()
        .map_err(|e: kdl::KdlError| Error::Config(format!("{}: {}", path.display(), e)))?;
    let config = BellwetherConfig::from_kdl(&doc)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    config
        .validate()
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    Ok(config)
}

/// Resolve configuration with full precedence chain.
pub fn resolve_config(storage: &Storage, overrides: &ConfigOverrides) -> Result<ResolvedConfig> {
    let system = match system_config_path() {
        Some(path) => read_config_file(&path)?,
        None => BellwetherConfig::new(),
    };
    let project = read_config_file(&storage.config_path())?;
    resolve_layers(storage.root(), &system, &project, overrides)
}

/// Resolve from already loaded layers. Relative handler directories are
/// taken relative to `storage_root`.
pub fn resolve_layers(
    storage_root: &Path,
    system: &BellwetherConfig,
    project: &BellwetherConfig,
    overrides: &ConfigOverrides,
) -> Result<ResolvedConfig> {
    if overrides.debounce_ms == Some(0) {
        return Err(Error::Config("--debounce-ms must be greater than 0".to_string()));
    }
    if overrides.poll_interval_ms == Some(0) {
        return Err(Error::Config(
            "--poll-interval-ms must be greater than 0".to_string(),
        ));
    }

    let mut result = ResolvedConfig::defaults(storage_root);

    if let Some(v) = pick(overrides.debounce_ms, project.debounce_ms, system.debounce_ms) {
        result.debounce_ms = v;
    }
    if let Some(v) = pick(
        overrides.poll_interval_ms,
        project.poll_interval_ms,
        system.poll_interval_ms,
    ) {
        result.poll_interval_ms = v;
    }
    if let Some(v) = pick(
        overrides.handlers_dir.clone(),
        project.handlers_dir.as_ref().map(PathBuf::from),
        system.handlers_dir.as_ref().map(PathBuf::from),
    ) {
        result.handlers_dir = Resolved::new(storage_root.join(v.value), v.source);
    }
    result.handler_timeout_secs = pick(
        None,
        project.handler_timeout_secs,
        system.handler_timeout_secs,
    );
    if let Some(v) = pick(None, project.label_changes, system.label_changes) {
        result.label_changes = v;
    }
    if let Some(v) = pick(
        None,
        project.epics_block_children,
        system.epics_block_children,
    ) {
        result.epics_block_children = v;
    }
    if let Some(v) = pick(None, project.idempotency, system.idempotency) {
        result.idempotency = v;
    }
    result.mutation_command = pick(
        None,
        project.mutation_command.clone(),
        system.mutation_command.clone(),
    );

    let mut schedules: BTreeMap<String, Resolved<ScheduleConfig>> = BTreeMap::new();
    for (layer, source) in [(system, ValueSource::System), (project, ValueSource::Project)] {
        for schedule in &layer.schedules {
            schedules.insert(
                schedule.name.clone(),
                Resolved::new(schedule.clone(), source),
            );
        }
    }
    result.schedules = schedules.into_values().collect();

    Ok(result)
}

fn pick<T>(cli: Option<T>, project: Option<T>, system: Option<T>) -> Option<Resolved<T>> {
    cli.map(|v| Resolved::new(v, ValueSource::CliFlag))
        .or_else(|| project.map(|v| Resolved::new(v, ValueSource::Project)))
        .or_else(|| system.map(|v| Resolved::new(v, ValueSource::System)))
}
