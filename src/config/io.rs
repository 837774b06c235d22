//! Configuration I/O - Loading and saving configuration
//!
//! Handles reading configuration from files and environment variables.

use std::path::Path;
use std::time::Duration;

use super::types::ServiceConfig;
use crate::error::{Error, Result};

/// Load configuration with layered precedence:
/// 1. Config file if it exists, otherwise defaults
/// 2. Environment variable overrides (includes .env)
pub fn load_config() -> Result<ServiceConfig> {
    let config_path = super::paths::config_path();

    let mut config = if config_path.exists() {
        load_config_from_path(&config_path)?
    } else {
        ServiceConfig::default()
    };

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<ServiceConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    // Detect format by extension
    let config: ServiceConfig = if path.extension().is_some_and(|ext| ext == "json") {
        // JSON5 is more lenient than strict JSON
        json5::from_str(&content).map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?
    } else if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?
    } else {
        json5::from_str(&content)
            .or_else(|_| toml::from_str(&content).map_err(|e| Error::Config(e.to_string())))
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
    };

    Ok(config)
}

/// Apply environment variable overrides to an existing config.
///
/// Loads `.env` first, then overlays any `SANDBOX_*` variables. Env vars
/// have the highest precedence: defaults < file < env.
pub fn apply_env_overrides(config: &mut ServiceConfig) {
    dotenvy::dotenv().ok();
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

fn parse_duration(raw: &str) -> Option<Duration> {
    humantime_serde::re::humantime::parse_duration(raw.trim()).ok()
}

fn apply_overrides_from<F>(config: &mut ServiceConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Pool
    if let Some(v) = lookup("SANDBOX_MIN_WORKERS").and_then(|v| v.parse().ok()) {
        config.pool.min_workers = v;
    }
    if let Some(v) = lookup("SANDBOX_MAX_WORKERS").and_then(|v| v.parse().ok()) {
        config.pool.max_workers = v;
    }
    if let Some(v) = lookup("SANDBOX_INITIAL_WORKERS").and_then(|v| v.parse().ok()) {
        config.pool.initial_workers = v;
    }
    if let Some(region) = lookup("SANDBOX_REGION") {
        config.pool.default_region = Some(region);
    }

    // Cache
    if let Some(v) = lookup("SANDBOX_CACHE_ENABLED") {
        config.cache.enabled = v != "false" && v != "0";
    }
    if let Some(v) = lookup("SANDBOX_CACHE_SIZE").and_then(|v| v.parse().ok()) {
        config.cache.max_size = v;
    }
    if let Some(v) = lookup("SANDBOX_CACHE_TTL").and_then(|v| parse_duration(&v)) {
        config.cache.default_ttl = v;
    }

    // Breaker
    if let Some(v) = lookup("SANDBOX_BREAKER_THRESHOLD").and_then(|v| v.parse().ok()) {
        config.breaker.failure_threshold = v;
    }
    if let Some(v) = lookup("SANDBOX_BREAKER_COOLDOWN").and_then(|v| parse_duration(&v)) {
        config.breaker.cooldown = v;
    }

    // Balancer
    if let Some(v) = lookup("SANDBOX_STRATEGY").and_then(|v| v.parse().ok()) {
        config.balancer.strategy = v;
    }

    // Processor
    if let Some(v) = lookup("SANDBOX_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
        config.processor.queue_capacity = v;
    }
    if let Some(v) = lookup("SANDBOX_PROCESSOR_WORKERS").and_then(|v| v.parse().ok()) {
        config.processor.workers = v;
    }

    // Execution
    if let Some(v) = lookup("SANDBOX_DEFAULT_TIMEOUT").and_then(|v| parse_duration(&v)) {
        config.execution.default_timeout = v;
    }
    if let Some(v) = lookup("SANDBOX_RETRY_LIMIT").and_then(|v| v.parse().ok()) {
        config.execution.retry_limit = v;
    }

    // Sandbox
    if let Some(v) = lookup("SANDBOX_BACKEND").and_then(|v| v.parse().ok()) {
        config.sandbox.backend = v;
    }
    if let Some(dir) = lookup("SANDBOX_ALLOWED_DIR") {
        config.sandbox.allowed_dir = std::path::PathBuf::from(dir);
    }

    // Gateway
    if let Some(v) = lookup("SANDBOX_GATEWAY_PORT").and_then(|v| v.parse().ok()) {
        config.gateway.port = v;
    }
    if let Some(bind) = lookup("SANDBOX_GATEWAY_BIND") {
        config.gateway.bind = bind;
    }
}

/// Save configuration to a file
pub fn save_config(config: &ServiceConfig, path: &Path) -> Result<()> {
    let content = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    } else {
        serde_json::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, StrategyKind};
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = ServiceConfig::default();
        config.pool.max_workers = 3;
        config.breaker.failure_window = Some(Duration::from_secs(20));
        save_config(&config, &path).unwrap();

        let loaded = load_config_from_path(&path).unwrap();
        assert_eq!(loaded.pool.max_workers, 3);
        assert_eq!(loaded.breaker.failure_window, Some(Duration::from_secs(20)));
        assert_eq!(loaded.cache.default_ttl, config.cache.default_ttl);
    }

    #[test]
    fn test_save_and_load_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = ServiceConfig::default();
        config.balancer.strategy = StrategyKind::Geographic;
        save_config(&config, &path).unwrap();

        let loaded = load_config_from_path(&path).unwrap();
        assert_eq!(loaded.balancer.strategy, StrategyKind::Geographic);
        assert_eq!(loaded.processor.submit_timeout, config.processor.submit_timeout);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ pool: ").unwrap();

        let err = load_config_from_path(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SANDBOX_MAX_WORKERS", "12"),
            ("SANDBOX_CACHE_TTL", "90s"),
            ("SANDBOX_STRATEGY", "round_robin"),
            ("SANDBOX_BACKEND", "scripted"),
            ("SANDBOX_RETRY_LIMIT", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = ServiceConfig::default();
        apply_overrides_from(&mut config, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.pool.max_workers, 12);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(90));
        assert_eq!(config.balancer.strategy, StrategyKind::RoundRobin);
        assert_eq!(config.sandbox.backend, BackendKind::Scripted);
        // Unparseable values leave the default in place
        assert_eq!(config.execution.retry_limit, 2);
    }
}
