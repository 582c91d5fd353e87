//! KDL schema for config.kdl.
//!
//! This module provides:
//! - The [`BellwetherConfig`] struct mirroring the file
//! - Parsing from a KDL document, rejecting values of the wrong type
//! - Validation of ranges, durations and schedule names

use crate::diff::EventKind;
use crate::dispatch::IdempotencyScope;
use crate::scheduler::parse_duration;
use kdl::{KdlDocument, KdlNode, KdlValue};
use serde::Serialize;

/// A `schedule` node: a handler name and how often it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleConfig {
    pub name: String,
    /// Interval as written, e.g. "15m"
    pub every: String,
}

/// Settings stored in config.kdl.
///
/// Every field is optional so a file only overrides what it names.
///
/// # KDL Schema
///
/// ```kdl
/// debounce-ms 250
/// poll-interval-ms 1000
/// handlers-dir "handlers"
/// handler-timeout-secs 60
/// label-changes #false
/// epics-block-children #true
/// idempotency "revision"   // or "event"
/// mutation-command "tracker issue"
/// schedule "digest" every="1h"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BellwetherConfig {
    /// Quiet period before a reconciliation pass
    pub debounce_ms: Option<u64>,

    /// Interval of the log size poll
    pub poll_interval_ms: Option<u64>,

    /// Handlers directory, relative to `.bellwether/`
    pub handlers_dir: Option<String>,

    /// Kill script handlers that run longer than this
    pub handler_timeout_secs: Option<u64>,

    /// Whether a label-only change counts as an update
    pub label_changes: Option<bool>,

    /// Whether depending on an open epic blocks an issue
    pub epics_block_children: Option<bool>,

    pub idempotency: Option<IdempotencyScope>,

    /// External command handlers use to create, update and close issues
    pub mutation_command: Option<String>,

    pub schedules: Vec<ScheduleConfig>,
}

impl BellwetherConfig {
    /// Create an empty config with no values set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config.kdl document.
    ///
    /// Unknown nodes are ignored; known nodes with a value of the wrong type
    /// are an error.
    pub fn from_kdl(doc: &KdlDocument) -> Result<Self, String> {
        let mut config = Self::new();

        config.debounce_ms = first_integer(doc, "debounce-ms")?;
        config.poll_interval_ms = first_integer(doc, "poll-interval-ms")?;
        config.handler_timeout_secs = first_integer(doc, "handler-timeout-secs")?;
        config.handlers_dir = first_string(doc, "handlers-dir")?;
        config.mutation_command = first_string(doc, "mutation-command")?;
        config.label_changes = first_bool(doc, "label-changes")?;
        config.epics_block_children = first_bool(doc, "epics-block-children")?;

        if let Some(scope) = first_string(doc, "idempotency")? {
            config.idempotency = Some(IdempotencyScope::parse(&scope).ok_or_else(|| {
                format!("idempotency must be \"event\" or \"revision\", got \"{}\"", scope)
            })?);
        }

        for node in doc.nodes().iter().filter(|n| n.name().value() == "schedule") {
            config.schedules.push(schedule_node(node)?);
        }

        Ok(config)
    }

    /// Validate the config values.
    ///
    /// Returns an error message if any value is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.debounce_ms == Some(0) {
            return Err("debounce-ms must be greater than 0".to_string());
        }
        if self.poll_interval_ms == Some(0) {
            return Err("poll-interval-ms must be greater than 0".to_string());
        }
        if self.handler_timeout_secs == Some(0) {
            return Err("handler-timeout-secs must be greater than 0".to_string());
        }
        if let Some(command) = &self.mutation_command {
            if command.trim().is_empty() {
                return Err("mutation-command cannot be empty".to_string());
            }
        }

        for schedule in &self.schedules {
            if EventKind::parse(&schedule.name).is_some() {
                return Err(format!(
                    "schedule \"{}\" collides with an issue event name",
                    schedule.name
                ));
            }
            let every = parse_duration(&schedule.every)
                .map_err(|e| format!("schedule \"{}\": {}", schedule.name, e))?;
            if every.is_zero() {
                return Err(format!("schedule \"{}\" needs a non-zero interval", schedule.name));
            }
        }
        Ok(())
    }
}

fn first_value<'a>(doc: &'a KdlDocument, name: &str) -> Option<&'a KdlValue> {
    doc.get(name)
        .and_then(|node| node.entries().first())
        .map(|entry| entry.value())
}

fn first_integer(doc: &KdlDocument, name: &str) -> Result<Option<u64>, String> {
    match first_value(doc, name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| format!("{} must be a non-negative integer", name)),
    }
}

fn first_string(doc: &KdlDocument, name: &str) -> Result<Option<String>, String> {
    match first_value(doc, name) {
        None => Ok(None),
        Some(value) => value
            .as_string()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| format!("{} must be a string", name)),
    }
}

fn first_bool(doc: &KdlDocument, name: &str) -> Result<Option<bool>, String> {
    match first_value(doc, name) {
        None => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| format!("{} must be #true or #false", name)),
    }
}

fn schedule_node(node: &KdlNode) -> Result<ScheduleConfig, String> {
    let name = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .ok_or("schedule needs a name, e.g. schedule \"digest\" every=\"1h\"")?;
    let every = node
        .entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some("every"))
        .and_then(|e| e.value().as_string())
        .ok_or_else(|| format!("schedule \"{}\" needs every=\"<duration>\"", name))?;

    Ok(ScheduleConfig {
        name: name.to_string(),
        every: every.to_string(),
    })
}
