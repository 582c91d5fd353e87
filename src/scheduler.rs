//! Interval schedules.
//!
//! Schedules live in an explicit [`ScheduleRegistry`] owned by the
//! [`Scheduler`]. The scheduler only decides *when* a schedule is due; it sends
//! the schedule name to the daemon, which dispatches it like any other handler
//! so schedule runs never overlap with issue dispatch.

use crate::diff::EventKind;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// A named handler that fires every `every`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    pub name: String,
    #[serde(serialize_with = "serialize_every")]
    pub every: Duration,
}

fn serialize_every<S: serde::Serializer>(every: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*every))
}

/// Registered schedules, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ScheduleRegistry {
    schedules: BTreeMap<String, Schedule>,
}

impl ScheduleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a schedule.
    ///
    /// Names that collide with issue event names and zero intervals are rejected.
    pub fn register(&mut self, name: impl Into<String>, every: Duration) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("Schedule name cannot be empty".to_string()));
        }
        if EventKind::parse(&name).is_some() {
            return Err(Error::InvalidInput(format!(
                "Schedule name '{}' is reserved for issue events",
                name
            )));
        }
        if every.is_zero() {
            return Err(Error::InvalidInput(format!(
                "Schedule '{}' needs a non-zero interval",
                name
            )));
        }
        self.schedules
            .insert(name.clone(), Schedule { name, every });
        Ok(())
    }

    /// Schedules in name order.
    pub fn list(&self) -> Vec<&Schedule> {
        self.schedules.values().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Schedule> {
        self.schedules.get(name)
    }

    pub fn clear(&mut self) {
        self.schedules.clear();
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }
}

/// Fires registered schedules on their intervals.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    registry: ScheduleRegistry,
}

impl Scheduler {
    pub fn new(registry: ScheduleRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ScheduleRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ScheduleRegistry {
        &mut self.registry
    }

    /// Start ticking. Each due schedule's name is sent on `due`; the first
    /// firing is one full interval after start. Returns `None` when nothing is
    /// registered.
    pub fn spawn(
        &self,
        due: mpsc::UnboundedSender<String>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        if self.registry.is_empty() {
            return None;
        }

        let start = Instant::now();
        let mut pending: Vec<(Instant, Schedule)> = self
            .registry
            .list()
            .into_iter()
            .map(|s| (start + s.every, s.clone()))
            .collect();
        info!(schedules = pending.len(), "scheduler started");

        Some(tokio::spawn(async move {
            loop {
                let Some(next) = pending.iter().map(|(at, _)| *at).min() else {
                    break;
                };

                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep_until(next) => {
                        let now = Instant::now();
                        for (at, schedule) in pending.iter_mut().filter(|(at, _)| *at <= now) {
                            debug!(schedule = %schedule.name, "schedule due");
                            if due.send(schedule.name.clone()).is_err() {
                                return;
                            }
                            *at += schedule.every;
                            if *at <= now {
                                *at = now + schedule.every;
                            }
                        }
                    }
                }
            }
            debug!("scheduler stopped");
        }))
    }
}

/// Parse `<n>ms`, `<n>s`, `<n>m` or `<n>h`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| Error::InvalidInput(format!("Missing unit in duration '{}'", s)))?;
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidInput(format!("Invalid duration '{}'", s)))?;

    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(Error::InvalidInput(format!(
            "Unknown unit '{}' in duration '{}' (use ms, s, m or h)",
            unit, s
        ))),
    }
}

/// Inverse of [`parse_duration`], using the largest exact unit.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 || ms % 1000 != 0 {
        format!("{}ms", ms)
    } else if ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else {
        format!("{}s", ms / 1000)
    }
}
