//! # Scalable Sandbox
//!
//! Pooled, cached and fault-isolated execution of short-lived untrusted code
//! snippets, for code-generation pipelines and other batch callers.
//!
//! ## Features
//!
//! - **Bounded Worker Pool:** One execution per instance, explicit scale up/down with draining
//! - **Health-Aware Routing:** Round-robin, weighted, least-connections, session affinity, geographic
//! - **Circuit Breakers:** Per-instance closed/open/half-open with a single recovery probe
//! - **Result Cache:** Content-addressed, TTL-bounded, FIFO eviction
//! - **Bounded Async Queue:** Backpressure, correlation ids, graceful shutdown
//! - **Metrics:** Rolling-window latency percentiles and a capacity signal

pub mod api;
pub mod balancer;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod processor;
pub mod sandbox;
pub mod service;

pub use config::ServiceConfig;
pub use error::{Error, ErrorKind, Result};
pub use sandbox::{ExecutionRequest, ExecutionResult, Language};
pub use service::{BatchSession, ScalableSandboxService, ServiceStatus};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
