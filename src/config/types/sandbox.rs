//! Sandbox configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Isolation backend
    #[serde(default)]
    pub backend: BackendKind,
    /// Root for per-instance working directories
    #[serde(default = "default_allowed_dir")]
    pub allowed_dir: PathBuf,
    /// Maximum output size in bytes
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            backend: BackendKind::default(),
            allowed_dir: default_allowed_dir(),
            max_output_bytes: default_max_output(),
        }
    }
}

fn default_allowed_dir() -> PathBuf {
    crate::config::workspace_dir()
}

fn default_max_output() -> usize {
    1024 * 1024 // 1MB
}

/// Isolation backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Child interpreter process per run
    #[default]
    Process,
    /// In-memory echo backend
    Scripted,
}

impl std::str::FromStr for BackendKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" | "os" => Ok(BackendKind::Process),
            "scripted" | "echo" | "dry-run" => Ok(BackendKind::Scripted),
            _ => Err(crate::error::Error::Config(format!(
                "Invalid sandbox backend: {}. Valid: process, scripted",
                s
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Process => write!(f, "process"),
            BackendKind::Scripted => write!(f, "scripted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("os".parse::<BackendKind>().unwrap(), BackendKind::Process);
        assert_eq!("echo".parse::<BackendKind>().unwrap(), BackendKind::Scripted);
        assert!("docker".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_sandbox_config_default() {
        let config = SandboxConfig::default();
        assert_eq!(config.backend, BackendKind::Process);
        assert_eq!(config.max_output_bytes, 1024 * 1024);
    }
}
