//! CLI argument definitions for bellwether.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Bellwether - runs handlers when issues in an append-only log change.
///
/// Start with `bw ready` to see what can be worked on, then `bw watch` to react
/// to changes as they are appended.
#[derive(Parser, Debug)]
#[command(name = "bw")]
#[command(author, version = version_string(), about = "Watches an issue log and runs handlers for every change", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Run as if bw was started in <path> instead of the current directory.
    /// The .bellwether directory is searched for upward from here.
    /// Can also be set via BW_REPO environment variable.
    #[arg(short = 'C', long = "repo", global = true, env = "BW_REPO")]
    pub repo_path: Option<PathBuf>,

    /// Directory holding handler executables (relative to .bellwether/)
    #[arg(long, global = true, env = "BW_HANDLERS_DIR")]
    pub handlers_dir: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

fn version_string() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("BW_GIT_COMMIT"),
        " ",
        env!("BW_BUILD_TIMESTAMP"),
        ")"
    )
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch the issue log and dispatch handlers until interrupted
    Watch {
        /// Quiet period before reconciling after a change
        #[arg(long)]
        debounce_ms: Option<u64>,

        /// How often to compare the log size as a fallback
        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },

    /// Run one reconciliation pass and dispatch its events
    ///
    /// Compares a before-snapshot with the current log. Without --before or
    /// --since every issue is treated as newly created.
    Run {
        /// Issue log file to diff against
        #[arg(long, conflicts_with = "since")]
        before: Option<PathBuf>,

        /// Git revision whose issue log to diff against
        #[arg(long)]
        since: Option<String>,
    },

    /// Run the handler for an event against one issue, ignoring the ledger
    Trigger {
        /// Event name (created, updated, closed, reopened, ready, blocked)
        event: String,
        /// Issue ID (e.g., bw-a1b2)
        id: String,
    },

    /// Re-run the handler that last failed for an issue and event
    Retry {
        /// Issue ID
        id: String,
        /// Event name
        event: String,

        /// Only show what would be retried
        #[arg(long)]
        dry_run: bool,
    },

    /// Execution ledger commands
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },

    /// Show issues ready to work on (no open dependencies)
    Ready,

    /// Show issues waiting on dependencies
    Blocked,

    /// Show epics and their progress
    Epics,

    /// Show the events between two issue log files
    Diff {
        /// Earlier issue log
        before: PathBuf,
        /// Later issue log
        after: PathBuf,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Ledger subcommands
#[derive(Subcommand, Debug)]
pub enum LedgerCommands {
    /// List execution records, oldest first
    List {
        /// Only records for this issue
        #[arg(long)]
        issue: Option<String>,

        /// Only records with this status (success, failed)
        #[arg(long)]
        status: Option<String>,

        /// Only records of this type (issue, schedule, manual)
        #[arg(long = "type")]
        execution_type: Option<String>,
    },

    /// List failed execution records
    Failed,
}

/// Configuration subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the resolved configuration and where each value came from
    Show,
}
