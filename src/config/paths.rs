//! Configuration paths
//!
//! Utilities for resolving configuration file paths.

use std::path::PathBuf;

const APP_DIR: &str = "scalable-sandbox";

/// Get the configuration directory
pub fn config_dir() -> PathBuf {
    // Check for explicit override
    if let Ok(dir) = std::env::var("SANDBOX_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".config").join(APP_DIR))
                .unwrap_or_else(|| PathBuf::from(".scalable-sandbox"))
        })
}

/// Get the main configuration file path
pub fn config_path() -> PathBuf {
    // Check for explicit override
    if let Ok(path) = std::env::var("SANDBOX_CONFIG") {
        return PathBuf::from(path);
    }

    config_dir().join("config.json")
}

/// Get the state directory
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SANDBOX_STATE_DIR") {
        return PathBuf::from(dir);
    }

    dirs::data_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".local").join("share").join(APP_DIR))
                .unwrap_or_else(|| PathBuf::from(".scalable-sandbox"))
        })
}

/// Root of the per-instance working directories
pub fn workspace_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SANDBOX_WORKSPACE") {
        return PathBuf::from(dir);
    }

    state_dir().join("instances")
}
