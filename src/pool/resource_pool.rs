//! Bounded pool of execution workers
//!
//! Each worker instance runs one execution at a time. Callers lease an
//! instance (any idle one, or the one the balancer picked) and hand it back
//! through [`PoolLease::release`]. Every lease also holds a permit from a
//! semaphore sized to `max_workers`, so the number of simultaneously busy
//! workers can never exceed that bound, including mid scale-down.
//!
//! # Architecture
//!
//! ```text
//! ResourcePool
//! ├─ registry: id -> WorkerInstance   (shared read-only with other components)
//! ├─ slots:    Semaphore(max_workers) (one permit per busy worker)
//! ├─ released: Notify                 (wakes waiters on release/scale/recovery)
//! └─ book:     Mutex                  (serializes claim/release/scale transitions)
//! ```

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::registry::{InstanceId, InstanceRegistry, LeaseOutcome, WorkerInstance};
use crate::config::{InstanceSpec, PoolConfig};
use crate::error::{Error, Result};

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub idle: usize,
    pub busy: usize,
    pub unhealthy: usize,
    pub draining: usize,
    pub total: usize,
    pub max_workers: usize,
}

impl PoolStatus {
    /// Busy share of the instance set
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.busy as f64 / self.total as f64
    }
}

#[derive(Default)]
struct PoolBook {
    next_ordinal: u64,
    retired: Vec<InstanceId>,
}

struct PoolShared {
    config: PoolConfig,
    registry: InstanceRegistry,
    slots: Arc<Semaphore>,
    released: Notify,
    book: Mutex<PoolBook>,
}

enum Claim {
    Claimed(OwnedSemaphorePermit),
    Wait,
}

impl PoolShared {
    fn add_instance(&self, book: &mut PoolBook, spec: &InstanceSpec) -> InstanceId {
        book.next_ordinal += 1;
        let id = format!("worker-{:04}", book.next_ordinal);
        self.registry.insert(WorkerInstance::new(
            id.clone(),
            book.next_ordinal,
            spec.weight,
            spec.region.clone(),
        ));
        id
    }

    fn claim(&self, id: &str) -> Result<Claim> {
        let _book = self.book.lock();
        let instance = self
            .registry
            .get(id)
            .ok_or_else(|| Error::InstanceUnavailable(id.to_string()))?;

        if !instance.is_routable() {
            return Err(Error::InstanceUnavailable(id.to_string()));
        }
        if instance.busy {
            return Ok(Claim::Wait);
        }

        match self.slots.clone().try_acquire_owned() {
            Ok(permit) => {
                self.registry.update(id, |i| i.busy = true);
                Ok(Claim::Claimed(permit))
            }
            Err(_) => Ok(Claim::Wait),
        }
    }

    fn claim_any(&self) -> Option<(InstanceId, OwnedSemaphorePermit)> {
        let _book = self.book.lock();
        let candidate = self
            .registry
            .snapshot()
            .into_iter()
            .find(|i| i.is_routable() && !i.busy)?;

        let permit = self.slots.clone().try_acquire_owned().ok()?;
        self.registry.update(&candidate.id, |i| i.busy = true);
        Some((candidate.id, permit))
    }

    fn release(&self, id: &str, outcome: LeaseOutcome, busy_for: Duration) {
        let mut book = self.book.lock();
        let retire = self
            .registry
            .update(id, |i| {
                i.busy = false;
                i.executions += 1;
                if outcome != LeaseOutcome::Success {
                    i.failures += 1;
                }
                i.total_busy += busy_for;
                i.last_outcome = Some(outcome);
                i.draining
            })
            .unwrap_or(false);

        if retire {
            self.registry.remove(id);
            book.retired.push(id.to_string());
            info!("Retired drained instance {}", id);
        } else {
            debug!("Released instance {} ({:?})", id, outcome);
        }
    }
}

/// A leased worker. Release it explicitly; dropping it releases as `Abandoned`.
pub struct PoolLease {
    pool: Arc<PoolShared>,
    instance_id: InstanceId,
    permit: Option<OwnedSemaphorePermit>,
    started: Instant,
    released: bool,
}

impl PoolLease {
    /// Instance this lease holds
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Return the instance with the execution outcome
    pub fn release(mut self, outcome: LeaseOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: LeaseOutcome) {
        if self.released {
            return;
        }
        self.released = true;
        self.pool
            .release(&self.instance_id, outcome, self.started.elapsed());
        drop(self.permit.take());
        self.pool.released.notify_waiters();
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if !self.released {
            warn!("Lease on {} dropped without release", self.instance_id);
            self.finish(LeaseOutcome::Abandoned);
        }
    }
}

impl std::fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease")
            .field("instance_id", &self.instance_id)
            .field("released", &self.released)
            .finish()
    }
}

/// Decrements the waiter count of an instance when the wait ends, however it ends
struct WaiterGuard<'a> {
    registry: &'a InstanceRegistry,
    id: &'a str,
}

impl<'a> WaiterGuard<'a> {
    fn new(registry: &'a InstanceRegistry, id: &'a str) -> Self {
        registry.update(id, |i| i.waiters += 1);
        WaiterGuard { registry, id }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .update(self.id, |i| i.waiters = i.waiters.saturating_sub(1));
    }
}

/// Resource pool of worker instances
#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<PoolShared>,
}

impl ResourcePool {
    /// Create a pool with its startup instances
    pub fn new(config: PoolConfig) -> Self {
        let registry = InstanceRegistry::new();
        let slots = Arc::new(Semaphore::new(config.max_workers));
        let pool = ResourcePool {
            inner: Arc::new(PoolShared {
                config,
                registry,
                slots,
                released: Notify::new(),
                book: Mutex::new(PoolBook::default()),
            }),
        };

        {
            let config = &pool.inner.config;
            let mut specs = config.startup_instances();
            while specs.len() < config.min_workers {
                specs.push(InstanceSpec {
                    weight: config.default_weight,
                    region: config.default_region.clone(),
                });
            }
            specs.truncate(config.max_workers);

            let mut book = pool.inner.book.lock();
            for spec in &specs {
                pool.inner.add_instance(&mut book, spec);
            }
        }

        info!(
            "Resource pool initialized with {} instances (min {}, max {})",
            pool.inner.registry.len(),
            pool.inner.config.min_workers,
            pool.inner.config.max_workers
        );
        pool
    }

    /// Read-only handle to the instance set
    pub fn registry(&self) -> InstanceRegistry {
        self.inner.registry.clone()
    }

    /// Lease any idle instance, waiting up to `timeout`
    pub async fn acquire(&self, timeout: Duration) -> Result<PoolLease> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some((id, permit)) = self.inner.claim_any() {
                debug!("Acquired instance {}", id);
                return Ok(self.lease(id, permit));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::AcquireTimeout(timeout));
            }
        }
    }

    /// Lease a specific instance, waiting up to `timeout` for it to go idle.
    ///
    /// Fails fast with `InstanceUnavailable` if the instance is gone,
    /// draining or unhealthy.
    pub async fn acquire_instance(&self, id: &str, timeout: Duration) -> Result<PoolLease> {
        let deadline = Instant::now() + timeout;
        let mut waiter: Option<WaiterGuard<'_>> = None;
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.claim(id)? {
                Claim::Claimed(permit) => {
                    drop(waiter);
                    debug!("Acquired instance {}", id);
                    return Ok(self.lease(id.to_string(), permit));
                }
                Claim::Wait => {
                    if waiter.is_none() {
                        waiter = Some(WaiterGuard::new(&self.inner.registry, id));
                    }
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::AcquireTimeout(timeout));
            }
        }
    }

    fn lease(&self, instance_id: InstanceId, permit: OwnedSemaphorePermit) -> PoolLease {
        PoolLease {
            pool: self.inner.clone(),
            instance_id,
            permit: Some(permit),
            started: Instant::now(),
            released: false,
        }
    }

    /// Return a leased instance and record its outcome
    pub fn release(&self, lease: PoolLease, outcome: LeaseOutcome) {
        lease.release(outcome);
    }

    /// Add up to `n` instances without exceeding `max_workers`. Returns the new ids.
    pub fn scale_up(&self, n: usize) -> Vec<InstanceId> {
        let config = &self.inner.config;
        let added: Vec<InstanceId> = {
            let mut book = self.inner.book.lock();
            let room = config.max_workers.saturating_sub(self.inner.registry.len());
            let spec = InstanceSpec {
                weight: config.default_weight,
                region: config.default_region.clone(),
            };
            (0..n.min(room))
                .map(|_| self.inner.add_instance(&mut book, &spec))
                .collect()
        };

        if added.len() < n {
            warn!(
                "Scale up capped at max_workers ({}): requested {}, added {}",
                config.max_workers,
                n,
                added.len()
            );
        }
        if !added.is_empty() {
            info!("Scaled up by {} instances", added.len());
            self.inner.released.notify_waiters();
        }
        added
    }

    /// Remove up to `n` instances without going below `min_workers`.
    ///
    /// Idle instances are removed at once; busy ones are marked draining
    /// and leave on release. Returns the number of instances affected.
    pub fn scale_down(&self, n: usize) -> usize {
        let mut book = self.inner.book.lock();
        let snapshot = self.inner.registry.snapshot();
        let active: Vec<&WorkerInstance> = snapshot.iter().filter(|i| !i.draining).collect();
        let removable = active.len().saturating_sub(self.inner.config.min_workers);
        let target = n.min(removable);

        // Unhealthy first, then newest
        let mut order: Vec<&WorkerInstance> = active;
        order.sort_by_key(|i| (i.healthy, std::cmp::Reverse(i.ordinal)));
        let (mut idle, mut busy): (Vec<_>, Vec<_>) = order.into_iter().partition(|i| !i.busy);
        idle.append(&mut busy);

        let mut removed = 0;
        let mut drained = 0;
        for instance in idle.into_iter().take(target) {
            if instance.busy {
                self.inner.registry.update(&instance.id, |i| i.draining = true);
                drained += 1;
            } else {
                self.inner.registry.remove(&instance.id);
                book.retired.push(instance.id.clone());
                removed += 1;
            }
        }

        if target < n {
            warn!(
                "Scale down capped at min_workers ({}): requested {}, affected {}",
                self.inner.config.min_workers, n, target
            );
        }
        info!("Scaled down: {} removed, {} draining", removed, drained);
        removed + drained
    }

    /// Move an instance in or out of the unhealthy state
    pub fn set_health(&self, id: &str, healthy: bool) -> bool {
        let changed = {
            let _book = self.inner.book.lock();
            self.inner.registry.update(id, |i| {
                let changed = i.healthy != healthy;
                i.healthy = healthy;
                i.last_health_check = Some(Utc::now());
                changed
            })
        };

        match changed {
            Some(true) => {
                if healthy {
                    info!("Instance {} is healthy again", id);
                    self.inner.released.notify_waiters();
                } else {
                    warn!("Instance {} marked unhealthy", id);
                }
                true
            }
            Some(false) => true,
            None => false,
        }
    }

    /// Stamp the time of the latest health check on an instance
    pub fn note_health_check(&self, id: &str) {
        self.inner
            .registry
            .update(id, |i| i.last_health_check = Some(Utc::now()));
    }

    /// Instances removed since the last call
    pub fn drain_retired(&self) -> Vec<InstanceId> {
        std::mem::take(&mut self.inner.book.lock().retired)
    }

    /// Current counts by state
    pub fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            idle: 0,
            busy: 0,
            unhealthy: 0,
            draining: 0,
            total: 0,
            max_workers: self.inner.config.max_workers,
        };
        for instance in self.inner.registry.snapshot() {
            status.total += 1;
            if instance.draining {
                status.draining += 1;
            } else if !instance.healthy {
                status.unhealthy += 1;
            } else if instance.busy {
                status.busy += 1;
            } else {
                status.idle += 1;
            }
        }
        status
    }

    /// Workers currently executing, including draining ones
    pub fn busy_count(&self) -> usize {
        self.inner
            .registry
            .snapshot()
            .iter()
            .filter(|i| i.busy)
            .count()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}
