//! Configuration for bellwether.
//!
//! Settings live in `config.kdl` files at two levels:
//!
//! - System: `$BW_CONFIG_DIR/config.kdl`, else `~/.config/bellwether/config.kdl`
//! - Project: `<project>/.bellwether/config.kdl`
//!
//! Precedence: CLI flag > project config > system config > defaults.
//! Use the [`resolver`] module for precedence resolution.

pub mod resolver;
pub mod schema;

pub use resolver::{
    ConfigOverrides, Resolved, ResolvedConfig, ValueSource, read_config_file, resolve_config,
};
pub use schema::{BellwetherConfig, ScheduleConfig};

use std::path::PathBuf;

/// Environment variable overriding the system config directory.
pub const CONFIG_DIR_ENV: &str = "BW_CONFIG_DIR";

/// Path of the system-level config.kdl, if a config directory is known.
pub fn system_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.is_empty() {
            return Some(PathBuf::from(dir).join(crate::storage::CONFIG_FILE));
        }
    }
    dirs::config_dir().map(|d| d.join("bellwether").join(crate::storage::CONFIG_FILE))
}
