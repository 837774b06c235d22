//! Load balancer - routes requests to eligible worker instances
//!
//! The balancer never holds a reference to the health monitor. It reads
//! health and draining flags from the shared instance registry and breaker
//! state from the circuit breakers, filters the candidates, then hands them
//! to the configured [`SelectionStrategy`].

mod strategy;

pub use strategy::{
    build_strategy, Geographic, InstanceView, LeastConnections, RoundRobin, RoutingContext,
    SelectionStrategy, SessionAffinity, Weighted,
};

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::breaker::CircuitBreaker;
use crate::config::BalancerConfig;
use crate::error::{Error, Result};
use crate::pool::{InstanceId, InstanceRegistry};
use crate::sandbox::ExecutionRequest;

impl RoutingContext {
    pub fn for_request(request: &ExecutionRequest) -> Self {
        RoutingContext {
            session_id: request.session_id.clone(),
            region: request.region.clone(),
        }
    }
}

/// Health-aware load balancer
pub struct LoadBalancer {
    registry: InstanceRegistry,
    breaker: Arc<CircuitBreaker>,
    strategy: Box<dyn SelectionStrategy>,
}

impl LoadBalancer {
    /// Create a balancer with the configured strategy
    pub fn new(config: &BalancerConfig, registry: InstanceRegistry, breaker: Arc<CircuitBreaker>) -> Self {
        Self::with_strategy(build_strategy(config), registry, breaker)
    }

    /// Create a balancer with a custom strategy
    pub fn with_strategy(
        strategy: Box<dyn SelectionStrategy>,
        registry: InstanceRegistry,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        LoadBalancer {
            registry,
            breaker,
            strategy,
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Instances that are healthy, not draining and not behind an open breaker
    pub fn eligible(&self) -> Vec<InstanceView> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|i| i.is_routable() && !self.breaker.is_open(&i.id))
            .map(|i| InstanceView {
                load: i.load(),
                id: i.id,
                ordinal: i.ordinal,
                weight: i.weight,
                region: i.region,
                executions: i.executions,
            })
            .collect()
    }

    /// Pick an instance for `request`
    pub fn select(&self, request: &ExecutionRequest) -> Result<InstanceId> {
        self.select_avoiding(request, &HashSet::new())
    }

    /// Pick an instance, preferring ones outside `avoid` when any are eligible
    pub fn select_avoiding(
        &self,
        request: &ExecutionRequest,
        avoid: &HashSet<InstanceId>,
    ) -> Result<InstanceId> {
        let ctx = RoutingContext::for_request(request);
        let eligible = self.eligible();
        if eligible.is_empty() {
            return Err(Error::NoAvailableInstance(format!(
                "none of {} instances is healthy with a closed circuit",
                self.registry.len()
            )));
        }

        let preferred: Vec<InstanceView> = eligible
            .iter()
            .filter(|c| !avoid.contains(&c.id))
            .cloned()
            .collect();
        let candidates = if preferred.is_empty() { &eligible } else { &preferred };

        let picked = self.strategy.select(&ctx, candidates).ok_or_else(|| {
            Error::NoAvailableInstance(format!("{} strategy made no pick", self.strategy.name()))
        })?;

        debug!(
            correlation_id = %request.correlation_id,
            strategy = self.strategy.name(),
            candidates = candidates.len(),
            "Routed to {}",
            picked
        );
        Ok(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, PoolConfig, StrategyKind};
    use crate::pool::ResourcePool;
    use crate::sandbox::Language;

    fn setup(strategy: StrategyKind, workers: usize) -> (ResourcePool, Arc<CircuitBreaker>, LoadBalancer) {
        let pool = ResourcePool::new(PoolConfig {
            min_workers: 1,
            max_workers: workers,
            initial_workers: workers,
            ..Default::default()
        });
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        }));
        let balancer = LoadBalancer::new(
            &BalancerConfig {
                strategy,
                ..Default::default()
            },
            pool.registry(),
            breaker.clone(),
        );
        (pool, breaker, balancer)
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest::new("print(1)", Language::Python)
    }

    #[test]
    fn test_round_robin_fairness_through_balancer() {
        let (_pool, _breaker, balancer) = setup(StrategyKind::RoundRobin, 3);
        let mut picked: Vec<InstanceId> = (0..3).map(|_| balancer.select(&request()).unwrap()).collect();
        picked.sort();
        assert_eq!(picked, vec!["worker-0001", "worker-0002", "worker-0003"]);
    }

    #[test]
    fn test_filters_unhealthy_and_open() {
        let (pool, breaker, balancer) = setup(StrategyKind::RoundRobin, 3);
        pool.set_health("worker-0001", false);
        breaker.try_acquire("worker-0002").unwrap().failure();

        for _ in 0..4 {
            assert_eq!(balancer.select(&request()).unwrap(), "worker-0003");
        }

        pool.set_health("worker-0003", false);
        let err = balancer.select(&request()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NoAvailableInstance);
    }

    #[test]
    fn test_select_avoiding() {
        let (_pool, _breaker, balancer) = setup(StrategyKind::LeastConnections, 2);
        let avoid: HashSet<InstanceId> = ["worker-0001".to_string()].into_iter().collect();
        assert_eq!(balancer.select_avoiding(&request(), &avoid).unwrap(), "worker-0002");

        // Avoiding everything still routes
        let avoid_all: HashSet<InstanceId> = ["worker-0001".to_string(), "worker-0002".to_string()]
            .into_iter()
            .collect();
        assert!(balancer.select_avoiding(&request(), &avoid_all).is_ok());
    }

    #[tokio::test]
    async fn test_least_connections_sees_pool_load() {
        let (pool, _breaker, balancer) = setup(StrategyKind::LeastConnections, 2);
        let lease = pool
            .acquire_instance("worker-0001", std::time::Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(balancer.select(&request()).unwrap(), "worker-0002");
        lease.release(crate::pool::LeaseOutcome::Success);
    }

    #[test]
    fn test_session_affinity_through_balancer() {
        let (_pool, _breaker, balancer) = setup(StrategyKind::SessionAffinity, 4);
        let sticky = request().with_session("user-42");
        let first = balancer.select(&sticky).unwrap();
        for _ in 0..5 {
            assert_eq!(balancer.select(&sticky).unwrap(), first);
        }
    }
}
