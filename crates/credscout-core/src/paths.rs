use crate::error::{DiscoveryError, Result};
use std::path::PathBuf;

const CREDSCOUT_DIR: &str = ".credscout";
const HISTORY_FILE: &str = "cli-token-history.json";
const CONFIG_FILE: &str = "config.toml";

/// Environment variable to override the credscout directory.
const CREDSCOUT_DIR_ENV: &str = "CREDSCOUT_DIR";

/// Resolve the credscout data directory.
/// Priority: CREDSCOUT_DIR env var > ~/.credscout/
pub fn resolve_credscout_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(CREDSCOUT_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    home_dir().map(|h| h.join(CREDSCOUT_DIR))
}

/// The current user's home directory.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .ok_or_else(|| DiscoveryError::Config("Failed to determine home directory".to_string()))
}

/// Get the history file path: ~/.credscout/cli-token-history.json
pub fn history_path() -> Result<PathBuf> {
    Ok(resolve_credscout_dir()?.join(HISTORY_FILE))
}

/// Get the config file path: ~/.credscout/config.toml
pub fn config_path() -> Result<PathBuf> {
    Ok(resolve_credscout_dir()?.join(CONFIG_FILE))
}
