//! Configuration module
//!
//! - types/: typed configuration sections (pool, routing, execution, sandbox)
//! - io.rs: loading and saving, environment overrides
//! - validation.rs: configuration validation
//! - paths.rs: configuration file paths

mod io;
mod paths;
mod types;
mod validation;

pub use types::{GatewayConfig, ServiceConfig};

pub use types::execution::{CacheConfig, ExecutionConfig, MetricsConfig, ProcessorConfig};
pub use types::pool::{InstanceSpec, PoolConfig};
pub use types::routing::{BalancerConfig, BaseStrategy, BreakerConfig, HealthConfig, StrategyKind};
pub use types::sandbox::{BackendKind, SandboxConfig};

pub use io::{apply_env_overrides, load_config, load_config_from_path, save_config};
pub use paths::{config_dir, config_path, state_dir, workspace_dir};
pub use validation::{validate_config, ConfigValidationResult, ValidationIssue};
