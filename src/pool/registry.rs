//! Shared instance registry
//!
//! The registry is the single copy of every [`WorkerInstance`]. Only the
//! pool module can mutate it; the balancer, health monitor and service get
//! a cloned [`InstanceRegistry`] handle and read snapshots from it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Instance identifier
pub type InstanceId = String;

/// Lifecycle state of a worker instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Idle,
    Busy,
    Unhealthy,
    Draining,
}

/// How a lease ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseOutcome {
    Success,
    Failure,
    /// Dropped without an explicit release (cancelled caller)
    Abandoned,
}

/// A worker instance as stored in the registry
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInstance {
    pub id: InstanceId,
    /// Creation ordinal; gives selection a stable order
    pub ordinal: u64,
    pub state: InstanceState,
    /// Capacity weight for weighted routing
    pub weight: u32,
    /// Region tag for geographic routing
    pub region: Option<String>,
    /// Execution in progress on this instance
    pub busy: bool,
    /// Requests waiting for this specific instance
    pub waiters: usize,
    /// Set when a scale-down picked a busy instance; it leaves on release
    pub draining: bool,
    /// Cleared by the health monitor via the pool
    pub healthy: bool,
    pub executions: u64,
    pub failures: u64,
    #[serde(with = "humantime_serde")]
    pub total_busy: Duration,
    pub last_outcome: Option<LeaseOutcome>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl WorkerInstance {
    pub(super) fn new(id: InstanceId, ordinal: u64, weight: u32, region: Option<String>) -> Self {
        WorkerInstance {
            id,
            ordinal,
            state: InstanceState::Idle,
            weight,
            region,
            busy: false,
            waiters: 0,
            draining: false,
            healthy: true,
            executions: 0,
            failures: 0,
            total_busy: Duration::ZERO,
            last_outcome: None,
            last_health_check: None,
        }
    }

    /// Active executions plus queued waiters
    pub fn load(&self) -> usize {
        usize::from(self.busy) + self.waiters
    }

    /// Recompute `state` from the flags. Draining wins over unhealthy, which wins over busy.
    pub(super) fn refresh_state(&mut self) {
        self.state = if self.draining {
            InstanceState::Draining
        } else if !self.healthy {
            InstanceState::Unhealthy
        } else if self.busy {
            InstanceState::Busy
        } else {
            InstanceState::Idle
        };
    }

    /// Whether the balancer may route to this instance
    pub fn is_routable(&self) -> bool {
        self.healthy && !self.draining
    }
}

/// Read-only handle to the instance set
#[derive(Clone, Default)]
pub struct InstanceRegistry {
    instances: Arc<DashMap<InstanceId, WorkerInstance>>,
}

impl InstanceRegistry {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one instance
    pub fn get(&self, id: &str) -> Option<WorkerInstance> {
        self.instances.get(id).map(|entry| entry.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// Snapshot of all instances ordered by creation
    pub fn snapshot(&self) -> Vec<WorkerInstance> {
        let mut all: Vec<WorkerInstance> =
            self.instances.iter().map(|entry| entry.value().clone()).collect();
        all.sort_by_key(|instance| instance.ordinal);
        all
    }

    /// Ids ordered by creation
    pub fn ids(&self) -> Vec<InstanceId> {
        self.snapshot().into_iter().map(|instance| instance.id).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub(super) fn insert(&self, instance: WorkerInstance) {
        self.instances.insert(instance.id.clone(), instance);
    }

    pub(super) fn remove(&self, id: &str) -> Option<WorkerInstance> {
        self.instances.remove(id).map(|(_, instance)| instance)
    }

    /// Mutate one instance under its entry lock and refresh its state
    pub(super) fn update<R>(&self, id: &str, f: impl FnOnce(&mut WorkerInstance) -> R) -> Option<R> {
        self.instances.get_mut(id).map(|mut entry| {
            let out = f(entry.value_mut());
            entry.value_mut().refresh_state();
            out
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_precedence() {
        let mut instance = WorkerInstance::new("w".into(), 0, 1, None);
        instance.busy = true;
        instance.refresh_state();
        assert_eq!(instance.state, InstanceState::Busy);

        instance.healthy = false;
        instance.refresh_state();
        assert_eq!(instance.state, InstanceState::Unhealthy);
        assert!(!instance.is_routable());

        instance.draining = true;
        instance.refresh_state();
        assert_eq!(instance.state, InstanceState::Draining);
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let registry = InstanceRegistry::new();
        registry.insert(WorkerInstance::new("b".into(), 2, 1, None));
        registry.insert(WorkerInstance::new("a".into(), 1, 1, None));
        registry.insert(WorkerInstance::new("c".into(), 3, 1, None));
        assert_eq!(registry.ids(), vec!["a", "b", "c"]);

        registry.update("b", |i| i.waiters = 2);
        assert_eq!(registry.get("b").unwrap().load(), 2);
    }
}
