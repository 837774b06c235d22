//! Routing, breaker and health-check configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Load-balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Cycle through eligible instances
    RoundRobin,
    /// Random, proportional to capacity weight
    Weighted,
    /// Fewest active executions
    #[default]
    LeastConnections,
    /// Sticky session -> instance mapping on top of `base`
    SessionAffinity,
    /// Prefer the caller's region, then `base`
    Geographic,
}

impl std::str::FromStr for StrategyKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "rr" => Ok(StrategyKind::RoundRobin),
            "weighted" => Ok(StrategyKind::Weighted),
            "least_connections" | "least_conn" => Ok(StrategyKind::LeastConnections),
            "session_affinity" | "sticky" => Ok(StrategyKind::SessionAffinity),
            "geographic" | "geo" => Ok(StrategyKind::Geographic),
            _ => Err(crate::error::Error::Config(format!(
                "Invalid balancer strategy: {}. Valid: round_robin, weighted, least_connections, session_affinity, geographic",
                s
            ))),
        }
    }
}

/// Strategy that wrapping strategies delegate to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseStrategy {
    RoundRobin,
    Weighted,
    #[default]
    LeastConnections,
}

/// Load balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Selection strategy
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Underlying strategy for session affinity and geographic routing
    #[serde(default)]
    pub base: BaseStrategy,
    /// Idle time after which a session mapping is forgotten
    #[serde(default = "default_session_ttl", with = "humantime_serde")]
    pub session_ttl: Duration,
    /// Maximum number of remembered sessions
    #[serde(default = "default_session_capacity")]
    pub session_capacity: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        BalancerConfig {
            strategy: StrategyKind::default(),
            base: BaseStrategy::default(),
            session_ttl: default_session_ttl(),
            session_capacity: default_session_capacity(),
        }
    }
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_session_capacity() -> u64 {
    10_000
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,
    /// Failures further apart than this do not extend a streak
    #[serde(default, with = "humantime_serde")]
    pub failure_window: Option<Duration>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
            failure_window: None,
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Time between check rounds
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Consecutive failed checks before a target is marked unhealthy
    #[serde(default = "default_health_failures")]
    pub failure_threshold: u32,
    /// Upper bound on a single check
    #[serde(default = "default_check_timeout", with = "humantime_serde")]
    pub check_timeout: Duration,
    /// Trip the target's circuit breaker when it turns unhealthy
    #[serde(default = "default_true")]
    pub trip_breaker: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            interval: default_interval(),
            failure_threshold: default_health_failures(),
            check_timeout: default_check_timeout(),
            trip_breaker: true,
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_failures() -> u32 {
    3
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_true() -> bool {
    true
}
