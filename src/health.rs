//! Periodic health checking with alerting
//!
//! Each monitored target (a worker instance or any other component) has
//! one [`HealthCheck`]. The monitor counts consecutive failures; at
//! `failure_threshold` it marks the target unhealthy, optionally trips the
//! target's circuit breaker, and fires the alert callbacks. The first
//! successful check afterwards marks it healthy again.
//!
//! The monitor does not touch the pool. The service subscribes an alert
//! callback that forwards transitions to `ResourcePool::set_health`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::HealthConfig;
use crate::error::{Error, Result};

/// A health probe
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> Result<()>;
}

struct FnCheck<F>(F);

#[async_trait]
impl<F, Fut> HealthCheck for FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn check(&self) -> Result<()> {
        (self.0)().await
    }
}

/// Wrap an async closure as a [`HealthCheck`]
pub fn check_fn<F, Fut>(f: F) -> Arc<dyn HealthCheck>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnCheck(f))
}

/// Health of one target
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub last_check_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl Default for ComponentHealth {
    fn default() -> Self {
        ComponentHealth {
            healthy: true,
            last_check_at: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Unhealthy,
    Recovered,
}

/// Fired on every health transition
#[derive(Debug, Clone, Serialize)]
pub struct HealthAlert {
    pub target: String,
    pub kind: AlertKind,
    pub consecutive_failures: u32,
    pub at: DateTime<Utc>,
}

type AlertCallback = Arc<dyn Fn(&HealthAlert) + Send + Sync>;

/// Health monitor
pub struct HealthMonitor {
    config: HealthConfig,
    checks: DashMap<String, Arc<dyn HealthCheck>>,
    statuses: DashMap<String, ComponentHealth>,
    callbacks: RwLock<Vec<AlertCallback>>,
    breaker: Option<Arc<CircuitBreaker>>,
    cancel: CancellationToken,
}

impl HealthMonitor {
    /// Create a monitor. With a breaker and `trip_breaker`, unhealthy targets get their circuit opened.
    pub fn new(config: HealthConfig, breaker: Option<Arc<CircuitBreaker>>) -> Self {
        HealthMonitor {
            config,
            checks: DashMap::new(),
            statuses: DashMap::new(),
            callbacks: RwLock::new(Vec::new()),
            breaker,
            cancel: CancellationToken::new(),
        }
    }

    /// Monitor `target` with `check`. Re-registering replaces the check and keeps the status.
    pub fn register(&self, target: impl Into<String>, check: Arc<dyn HealthCheck>) {
        let target = target.into();
        self.statuses.entry(target.clone()).or_default();
        self.checks.insert(target, check);
    }

    pub fn unregister(&self, target: &str) {
        self.checks.remove(target);
        self.statuses.remove(target);
    }

    /// Keep only the targets for which `keep` returns true
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.checks.retain(|target, _| keep(target));
        self.statuses.retain(|target, _| keep(target));
    }

    /// Subscribe to health transitions
    pub fn on_alert(&self, callback: impl Fn(&HealthAlert) + Send + Sync + 'static) {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Run one check. Returns the target's health afterwards, or `None` if it is not registered.
    pub async fn check_target(&self, target: &str) -> Option<bool> {
        let check = self.checks.get(target).map(|c| c.value().clone())?;

        let outcome = match tokio::time::timeout(self.config.check_timeout, check.check()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.config.check_timeout)),
        };

        let (healthy, alert) = {
            let mut status = self.statuses.get_mut(target)?;
            status.last_check_at = Some(Utc::now());
            let alert = match outcome {
                Ok(()) => {
                    let recovered = !status.healthy;
                    status.healthy = true;
                    status.consecutive_failures = 0;
                    status.last_error = None;
                    recovered.then_some(AlertKind::Recovered)
                }
                Err(e) => {
                    status.consecutive_failures += 1;
                    status.last_error = Some(e.to_string());
                    debug!(
                        "Health check for {} failed ({}/{}): {}",
                        target, status.consecutive_failures, self.config.failure_threshold, e
                    );
                    if status.healthy && status.consecutive_failures >= self.config.failure_threshold {
                        status.healthy = false;
                        Some(AlertKind::Unhealthy)
                    } else {
                        None
                    }
                }
            };
            let alert = alert.map(|kind| HealthAlert {
                target: target.to_string(),
                kind,
                consecutive_failures: status.consecutive_failures,
                at: Utc::now(),
            });
            (status.healthy, alert)
        };

        if let Some(alert) = alert {
            self.fire(&alert);
        }
        Some(healthy)
    }

    fn fire(&self, alert: &HealthAlert) {
        match alert.kind {
            AlertKind::Unhealthy => {
                warn!(
                    "{} is unhealthy after {} failed checks",
                    alert.target, alert.consecutive_failures
                );
                if self.config.trip_breaker {
                    if let Some(breaker) = &self.breaker {
                        breaker.trip(&alert.target);
                    }
                }
            }
            AlertKind::Recovered => info!("{} recovered", alert.target),
        }

        let callbacks: Vec<AlertCallback> = self.callbacks.read().clone();
        for callback in callbacks {
            callback(alert);
        }
    }

    /// Check every target concurrently
    pub async fn check_all(&self) {
        let targets: Vec<String> = self.checks.iter().map(|c| c.key().clone()).collect();
        futures::future::join_all(targets.iter().map(|t| self.check_target(t))).await;
    }

    /// Check `target` now, off the caller's path
    pub fn schedule_recheck(self: &Arc<Self>, target: &str) -> JoinHandle<Option<bool>> {
        let monitor = Arc::clone(self);
        let target = target.to_string();
        debug!("Scheduling health re-check of {}", target);
        tokio::spawn(async move { monitor.check_target(&target).await })
    }

    /// Start the periodic check loop. It runs until [`shutdown`](Self::shutdown).
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            info!("Health monitor started, interval: {:?}", self.config.interval);

            // Skip the first immediate tick
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = interval.tick() => self.check_all().await,
                }
            }
            info!("Health monitor stopped");
        })
    }

    /// Stop the check loop
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> BTreeMap<String, ComponentHealth> {
        self.statuses
            .iter()
            .map(|s| (s.key().clone(), s.value().clone()))
            .collect()
    }

    pub fn status_of(&self, target: &str) -> Option<ComponentHealth> {
        self.statuses.get(target).map(|s| s.value().clone())
    }

    /// Whether every monitored target is healthy
    pub fn is_healthy(&self) -> bool {
        self.statuses.iter().all(|s| s.healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::config::BreakerConfig;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    fn config() -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(10),
            failure_threshold: 3,
            check_timeout: Duration::from_secs(1),
            trip_breaker: true,
        }
    }

    fn toggle() -> (Arc<AtomicBool>, Arc<dyn HealthCheck>) {
        let up = Arc::new(AtomicBool::new(true));
        let flag = up.clone();
        let check = check_fn(move || {
            let flag = flag.clone();
            async move {
                if flag.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(Error::Sandbox("down".into()))
                }
            }
        });
        (up, check)
    }

    #[tokio::test]
    async fn test_unhealthy_after_threshold_then_recovers() {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        let monitor = HealthMonitor::new(config(), Some(breaker.clone()));
        let (up, check) = toggle();
        monitor.register("worker-0001", check);

        let alerts = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = alerts.clone();
        monitor.on_alert(move |alert| sink.lock().push(alert.kind));

        up.store(false, Ordering::SeqCst);
        assert_eq!(monitor.check_target("worker-0001").await, Some(true));
        assert_eq!(monitor.check_target("worker-0001").await, Some(true));
        assert_eq!(monitor.check_target("worker-0001").await, Some(false));
        assert_eq!(breaker.state("worker-0001"), BreakerState::Open);

        // Further failures do not re-alert
        monitor.check_target("worker-0001").await;
        assert_eq!(monitor.status_of("worker-0001").unwrap().consecutive_failures, 4);

        up.store(true, Ordering::SeqCst);
        assert_eq!(monitor.check_target("worker-0001").await, Some(true));
        assert!(monitor.is_healthy());

        assert_eq!(*alerts.lock(), vec![AlertKind::Unhealthy, AlertKind::Recovered]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_check_counts_as_failure() {
        let monitor = HealthMonitor::new(
            HealthConfig {
                failure_threshold: 1,
                ..config()
            },
            None,
        );
        monitor.register("stuck", check_fn(|| std::future::pending::<Result<()>>()));

        assert_eq!(monitor.check_target("stuck").await, Some(false));
        let status = monitor.status_of("stuck").unwrap();
        assert!(status.last_error.unwrap().contains("timed out"));
        assert_eq!(monitor.check_target("missing").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_runs_until_shutdown() {
        let monitor = Arc::new(HealthMonitor::new(config(), None));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        monitor.register(
            "component",
            check_fn(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let handle = monitor.clone().spawn();
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        monitor.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_schedule_recheck_and_retain() {
        let monitor = Arc::new(HealthMonitor::new(config(), None));
        let (_, a) = toggle();
        let (_, b) = toggle();
        monitor.register("a", a);
        monitor.register("b", b);

        assert_eq!(monitor.schedule_recheck("a").await.unwrap(), Some(true));
        assert!(monitor.status_of("a").unwrap().last_check_at.is_some());

        monitor.retain(|t| t == "a");
        assert_eq!(monitor.status().len(), 1);
        monitor.unregister("a");
        assert!(monitor.status().is_empty());
    }
}
