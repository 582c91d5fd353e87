//! Bellwether CLI - runs handlers when issues in an append-only log change.

use bellwether::cli::{Cli, Commands, ConfigCommands, LedgerCommands};
use bellwether::commands::{self, Baseline, Output};
use bellwether::config::ConfigOverrides;
use clap::Parser;
use std::env;
use std::path::{Path, PathBuf};
use std::process;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `BW_LOG=bellwether=debug`.
const LOG_ENV: &str = "BW_LOG";

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;

    let default_level = match cli.command {
        Commands::Watch { .. } => "info",
        _ => "warn",
    };
    let _log_guard = init_logging(cli.log_file.as_deref(), cli.log_json, default_level);

    // Determine repo path: --repo flag > BW_REPO env > cwd
    let repo_path = resolve_repo_path(cli.repo_path, human);
    let mut overrides = ConfigOverrides::new();
    if let Some(dir) = cli.handlers_dir {
        overrides = overrides.with_handlers_dir(dir);
    }

    let result = run_command(cli.command, &repo_path, overrides, human);

    if let Err(e) = result {
        if human {
            eprintln!("Error: {}", e);
        } else {
            eprintln!("{}", serde_json::json!({ "error": e.to_string() }));
        }
        process::exit(1);
    }
}

/// Install the tracing subscriber. The returned guard flushes the log file on drop.
fn init_logging(log_file: Option<&Path>, json: bool, default_level: &str) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let file = log_file.and_then(|path| {
        let name = path.file_name()?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        Some(tracing_appender::rolling::never(dir, name))
    });

    match file {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = builder.with_writer(writer).with_ansi(false);
            let _ = if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            Some(guard)
        }
        None => {
            let builder = builder.with_writer(std::io::stderr);
            let _ = if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            None
        }
    }
}

/// Resolve the starting path for the `.bellwether` search.
///
/// Priority: --repo flag > BW_REPO env var > current working directory.
/// An explicit path must exist.
fn resolve_repo_path(explicit_path: Option<PathBuf>, human: bool) -> PathBuf {
    match explicit_path {
        Some(path) => {
            if !path.exists() {
                if human {
                    eprintln!(
                        "Error: Specified repo path does not exist: {}",
                        path.display()
                    );
                } else {
                    eprintln!(
                        "{}",
                        serde_json::json!({
                            "error": format!("Specified repo path does not exist: {}", path.display())
                        })
                    );
                }
                process::exit(1);
            }
            path
        }
        None => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

fn run_command(
    command: Commands,
    repo_path: &Path,
    mut overrides: ConfigOverrides,
    human: bool,
) -> Result<(), bellwether::Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match command {
        Commands::Watch {
            debounce_ms,
            poll_interval_ms,
        } => {
            if let Some(ms) = debounce_ms {
                overrides = overrides.with_debounce_ms(ms);
            }
            if let Some(ms) = poll_interval_ms {
                overrides = overrides.with_poll_interval_ms(ms);
            }
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "could not listen for ctrl-c");
                }
            };
            let result = runtime.block_on(commands::watch(repo_path, &overrides, shutdown))?;
            output(&result, human);
        }
        Commands::Run { before, since } => {
            let baseline = match (before, since) {
                (Some(path), _) => Baseline::File(path),
                (None, Some(rev)) => Baseline::GitRevision(rev),
                (None, None) => Baseline::Empty,
            };
            let result = runtime.block_on(commands::run(repo_path, &overrides, baseline))?;
            output(&result, human);
        }
        Commands::Trigger { event, id } => {
            let result = runtime.block_on(commands::trigger(repo_path, &overrides, &event, &id))?;
            output(&result, human);
        }
        Commands::Retry { id, event, dry_run } => {
            let result =
                runtime.block_on(commands::retry(repo_path, &overrides, &id, &event, dry_run))?;
            output(&result, human);
        }
        Commands::Ledger { command } => match command {
            LedgerCommands::List {
                issue,
                status,
                execution_type,
            } => {
                let result = commands::ledger_list(
                    repo_path,
                    issue.as_deref(),
                    status.as_deref(),
                    execution_type.as_deref(),
                )?;
                output(&result, human);
            }
            LedgerCommands::Failed => {
                let result = commands::ledger_failed(repo_path)?;
                output(&result, human);
            }
        },
        Commands::Ready => {
            let result = commands::ready(repo_path)?;
            output(&result, human);
        }
        Commands::Blocked => {
            let result = commands::blocked(repo_path)?;
            output(&result, human);
        }
        Commands::Epics => {
            let result = commands::epics(repo_path)?;
            output(&result, human);
        }
        Commands::Diff { before, after } => {
            let result = commands::diff(repo_path, &before, &after)?;
            output(&result, human);
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                let result = commands::config_show(repo_path, &overrides)?;
                output(&result, human);
            }
        },
    }

    Ok(())
}

/// Print output in JSON or human-readable format.
fn output<T: Output>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}
