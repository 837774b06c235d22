//! Execution, cache, processor and metrics configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-request defaults and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Wall-clock timeout for requests that do not set one
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,
    /// How long a request may wait for a pool slot
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Memory ceiling for requests that do not set one
    #[serde(default)]
    pub default_memory_bytes: Option<u64>,
    /// Retries after the first attempt for transient failures
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// First retry delay
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Retry delay cap
    #[serde(default = "default_retry_max_backoff", with = "humantime_serde")]
    pub retry_max_backoff: Duration,
    /// Largest accepted snippet
    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,
    /// In-flight requests per batch
    #[serde(default = "default_batch_concurrency")]
    pub batch_max_concurrency: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            default_timeout: default_timeout(),
            acquire_timeout: default_acquire_timeout(),
            default_memory_bytes: None,
            retry_limit: default_retry_limit(),
            retry_backoff: default_retry_backoff(),
            retry_max_backoff: default_retry_max_backoff(),
            max_code_bytes: default_max_code_bytes(),
            batch_max_concurrency: default_batch_concurrency(),
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_limit() -> u32 {
    2
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_retry_max_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_max_code_bytes() -> usize {
    256 * 1024
}

fn default_batch_concurrency() -> usize {
    16
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Disable to never consult or populate the cache
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Entry bound; the oldest insertion is evicted beyond it
    #[serde(default = "default_cache_size")]
    pub max_size: usize,
    /// TTL applied by `put_with_default_ttl`
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            max_size: default_cache_size(),
            default_ttl: default_ttl(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cache_size() -> usize {
    1024
}

fn default_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Async processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Bounded queue length
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Concurrent worker tasks
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Block this long on a full queue before rejecting; unset rejects at once
    #[serde(default = "default_submit_timeout", with = "humantime_serde")]
    pub submit_timeout: Option<Duration>,
    /// Time given to in-flight work on shutdown
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            submit_timeout: default_submit_timeout(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

fn default_workers() -> usize {
    8
}

fn default_submit_timeout() -> Option<Duration> {
    Some(Duration::from_secs(5))
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}

/// Rolling metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Span of the latency window
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,
    /// Upper bound on retained samples
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    /// How long utilization must stay past a threshold before it is reported
    #[serde(default = "default_capacity_window", with = "humantime_serde")]
    pub capacity_window: Duration,
    /// Utilization above which scale-up is signalled
    #[serde(default = "default_scale_up")]
    pub scale_up_threshold: f64,
    /// Utilization below which scale-down is signalled
    #[serde(default = "default_scale_down")]
    pub scale_down_threshold: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            window: default_window(),
            max_samples: default_max_samples(),
            capacity_window: default_capacity_window(),
            scale_up_threshold: default_scale_up(),
            scale_down_threshold: default_scale_down(),
        }
    }
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_max_samples() -> usize {
    10_000
}

fn default_capacity_window() -> Duration {
    Duration::from_secs(30)
}

fn default_scale_up() -> f64 {
    0.8
}

fn default_scale_down() -> f64 {
    0.2
}
