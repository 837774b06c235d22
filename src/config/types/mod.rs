//! Configuration types module
//!
//! One section per component, gathered under [`ServiceConfig`].

pub mod execution;
pub mod pool;
pub mod routing;
pub mod sandbox;

use serde::{Deserialize, Serialize};

/// Main service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Worker pool sizing
    #[serde(default)]
    pub pool: pool::PoolConfig,

    /// Result cache
    #[serde(default)]
    pub cache: execution::CacheConfig,

    /// Per-instance circuit breakers
    #[serde(default)]
    pub breaker: routing::BreakerConfig,

    /// Instance selection
    #[serde(default)]
    pub balancer: routing::BalancerConfig,

    /// Periodic health checks
    #[serde(default)]
    pub health: routing::HealthConfig,

    /// Rolling performance metrics
    #[serde(default)]
    pub metrics: execution::MetricsConfig,

    /// Async processor queue
    #[serde(default)]
    pub processor: execution::ProcessorConfig,

    /// Per-request defaults and retry policy
    #[serde(default)]
    pub execution: execution::ExecutionConfig,

    /// Isolation backend
    #[serde(default)]
    pub sandbox: sandbox::SandboxConfig,

    /// HTTP API
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl ServiceConfig {
    /// Load configuration from the config file and environment.
    ///
    /// Precedence: defaults < config file (if present) < environment.
    pub fn from_env() -> crate::error::Result<Self> {
        crate::config::load_config()
    }
}

/// Gateway (HTTP API) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

fn default_port() -> u16 {
    8787
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
