//! Centralized path functions for all app storage locations.
//!
//! Every default location the tools read or write is derived here.

use std::path::PathBuf;

/// Plan file looked up in the working directory when `--plan` is not given.
pub const DEFAULT_PLAN_FILE: &str = "darkhorses.plan.toml";

/// App cache root: `~/Library/Caches/darkhorses/` (macOS) or `~/.cache/darkhorses/` (Linux).
pub fn app_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("darkhorses"))
}

/// SQLite database file: `<app_cache_dir>/darkhorses.db`.
pub fn db_path() -> Option<PathBuf> {
    app_cache_dir().map(|d| d.join("darkhorses.db"))
}

/// Optional operator config: `<config_dir>/darkhorses/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("darkhorses").join("config.toml"))
}
