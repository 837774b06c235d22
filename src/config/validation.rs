//! Configuration validation
//!
//! Validates configuration and reports issues.

use super::types::ServiceConfig;

/// Result of configuration validation
#[derive(Debug, Clone)]
pub struct ConfigValidationResult {
    /// Whether the config is valid
    pub valid: bool,
    /// Validation errors (critical)
    pub errors: Vec<ValidationIssue>,
    /// Validation warnings (non-critical)
    pub warnings: Vec<ValidationIssue>,
}

impl ConfigValidationResult {
    /// Create a valid result
    pub fn valid() -> Self {
        ConfigValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.valid = false;
        self.errors.push(issue);
        self
    }

    /// Add a warning
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }

    /// Errors joined into one message, for surfacing as `Error::Config`
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|issue| format!("{}: {}", issue.path, issue.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// A validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the config field
    pub path: String,
    /// Issue message
    pub message: String,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Create a new issue
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Add a suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Validate the configuration
pub fn validate_config(config: &ServiceConfig) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::valid();

    result = validate_pool_config(config, result);
    result = validate_cache_config(config, result);
    result = validate_breaker_config(config, result);
    result = validate_processor_config(config, result);
    result = validate_sandbox_config(config, result);

    result
}

fn validate_pool_config(config: &ServiceConfig, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let pool = &config.pool;

    if pool.max_workers == 0 {
        result = result.with_error(
            ValidationIssue::new("pool.max_workers", "Pool must allow at least one worker")
                .with_suggestion("Set pool.max_workers to 1 or more"),
        );
    }

    if pool.min_workers > pool.max_workers {
        result = result.with_error(
            ValidationIssue::new(
                "pool.min_workers",
                format!(
                    "min_workers ({}) exceeds max_workers ({})",
                    pool.min_workers, pool.max_workers
                ),
            )
            .with_suggestion("Lower pool.min_workers or raise pool.max_workers"),
        );
    }

    let startup = pool.startup_instances().len();
    if startup > pool.max_workers {
        result = result.with_error(ValidationIssue::new(
            "pool.instances",
            format!(
                "{} startup instances exceed max_workers ({})",
                startup, pool.max_workers
            ),
        ));
    } else if startup < pool.min_workers {
        result = result.with_warning(
            ValidationIssue::new(
                "pool.initial_workers",
                format!(
                    "{} startup instances is below min_workers ({}); the pool will be topped up",
                    startup, pool.min_workers
                ),
            ),
        );
    }

    result
}

fn validate_cache_config(config: &ServiceConfig, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.cache.enabled && config.cache.max_size == 0 {
        result = result.with_error(
            ValidationIssue::new("cache.max_size", "Cache is enabled but holds no entries")
                .with_suggestion("Set cache.max_size above zero or cache.enabled = false"),
        );
    }
    result
}

fn validate_breaker_config(config: &ServiceConfig, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.breaker.failure_threshold == 0 {
        result = result.with_error(
            ValidationIssue::new(
                "breaker.failure_threshold",
                "A zero threshold would open every breaker immediately",
            )
            .with_suggestion("Set breaker.failure_threshold to 1 or more"),
        );
    }
    if config.health.failure_threshold == 0 {
        result = result.with_error(ValidationIssue::new(
            "health.failure_threshold",
            "Health failure threshold must be at least 1",
        ));
    }
    result
}

fn validate_processor_config(config: &ServiceConfig, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.processor.queue_capacity == 0 {
        result = result.with_error(ValidationIssue::new(
            "processor.queue_capacity",
            "Queue capacity must be at least 1",
        ));
    }
    if config.processor.workers == 0 {
        result = result.with_error(ValidationIssue::new(
            "processor.workers",
            "Processor needs at least one worker task",
        ));
    }
    if config.execution.batch_max_concurrency == 0 {
        result = result.with_error(ValidationIssue::new(
            "execution.batch_max_concurrency",
            "Batch concurrency must be at least 1",
        ));
    }
    if config.execution.batch_max_concurrency > config.processor.queue_capacity {
        result = result.with_warning(
            ValidationIssue::new(
                "execution.batch_max_concurrency",
                "Batch concurrency exceeds queue capacity; large batches will hit backpressure",
            )
            .with_suggestion("Raise processor.queue_capacity or lower execution.batch_max_concurrency"),
        );
    }
    result
}

fn validate_sandbox_config(config: &ServiceConfig, mut result: ConfigValidationResult) -> ConfigValidationResult {
    use super::types::sandbox::BackendKind;

    if config.sandbox.backend == BackendKind::Process && !config.sandbox.allowed_dir.exists() {
        result = result.with_warning(
            ValidationIssue::new(
                "sandbox.allowed_dir",
                format!(
                    "Sandbox directory does not exist: {}",
                    config.sandbox.allowed_dir.display()
                ),
            )
            .with_suggestion("It will be created on first run, or change sandbox.allowed_dir"),
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let config = ServiceConfig::default();
        let result = validate_config(&config);

        // Default config may warn but never errors
        assert!(result.errors.is_empty());
        assert!(result.valid);
    }

    #[test]
    fn test_min_above_max() {
        let mut config = ServiceConfig::default();
        config.pool.min_workers = 10;
        config.pool.max_workers = 2;
        config.pool.initial_workers = 2;

        let result = validate_config(&config);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.path == "pool.min_workers"));
        assert!(result.error_summary().contains("min_workers"));
    }

    #[test]
    fn test_zero_capacities() {
        let mut config = ServiceConfig::default();
        config.cache.max_size = 0;
        config.processor.queue_capacity = 0;
        config.breaker.failure_threshold = 0;

        let result = validate_config(&config);
        let paths: Vec<_> = result.errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"cache.max_size"));
        assert!(paths.contains(&"processor.queue_capacity"));
        assert!(paths.contains(&"breaker.failure_threshold"));
    }

    #[test]
    fn test_batch_concurrency_warning() {
        let mut config = ServiceConfig::default();
        config.processor.queue_capacity = 4;
        config.execution.batch_max_concurrency = 8;

        let result = validate_config(&config);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.path == "execution.batch_max_concurrency"));
    }
}
