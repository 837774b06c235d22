//! Instance selection strategies

use moka::sync::Cache;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{BalancerConfig, BaseStrategy, StrategyKind};
use crate::pool::InstanceId;

/// Caller attributes a strategy may route on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingContext {
    pub session_id: Option<String>,
    pub region: Option<String>,
}

/// What a strategy sees of an eligible instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceView {
    pub id: InstanceId,
    pub ordinal: u64,
    pub weight: u32,
    pub region: Option<String>,
    /// Active executions plus queued waiters
    pub load: usize,
    pub executions: u64,
}

/// Picks one instance out of the eligible candidates.
///
/// Candidates arrive already filtered for health, draining and open
/// breakers, sorted by creation ordinal.
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, ctx: &RoutingContext, candidates: &[InstanceView]) -> Option<InstanceId>;
}

/// Cycles through the candidates
#[derive(Default)]
pub struct RoundRobin {
    cursor: AtomicU64,
}

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, _ctx: &RoutingContext, candidates: &[InstanceView]) -> Option<InstanceId> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst) as usize % candidates.len();
        Some(candidates[index].id.clone())
    }
}

/// Random pick with probability proportional to weight
#[derive(Default)]
pub struct Weighted {
    fallback: RoundRobin,
}

impl SelectionStrategy for Weighted {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select(&self, ctx: &RoutingContext, candidates: &[InstanceView]) -> Option<InstanceId> {
        match WeightedIndex::new(candidates.iter().map(|c| c.weight)) {
            Ok(distribution) => {
                let index = distribution.sample(&mut rand::rng());
                Some(candidates[index].id.clone())
            }
            // Empty or all-zero weights
            Err(_) => self.fallback.select(ctx, candidates),
        }
    }
}

/// Fewest active executions; ties go to the less used, then older instance
#[derive(Default)]
pub struct LeastConnections;

impl SelectionStrategy for LeastConnections {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn select(&self, _ctx: &RoutingContext, candidates: &[InstanceView]) -> Option<InstanceId> {
        candidates
            .iter()
            .min_by_key(|c| (c.load, c.executions, c.ordinal))
            .map(|c| c.id.clone())
    }
}

/// Sticky session routing.
///
/// A session seen for the first time is routed by the base strategy and the
/// pick is remembered. A remembered instance that is no longer a candidate
/// is replaced by a fresh pick.
pub struct SessionAffinity {
    base: Box<dyn SelectionStrategy>,
    sessions: Cache<String, InstanceId>,
}

impl SessionAffinity {
    pub fn new(base: Box<dyn SelectionStrategy>, config: &BalancerConfig) -> Self {
        SessionAffinity {
            base,
            sessions: Cache::builder()
                .max_capacity(config.session_capacity)
                .time_to_idle(config.session_ttl)
                .build(),
        }
    }

    /// Instance currently mapped to a session
    pub fn mapped(&self, session_id: &str) -> Option<InstanceId> {
        self.sessions.get(session_id)
    }
}

impl SelectionStrategy for SessionAffinity {
    fn name(&self) -> &'static str {
        "session_affinity"
    }

    fn select(&self, ctx: &RoutingContext, candidates: &[InstanceView]) -> Option<InstanceId> {
        let Some(session) = &ctx.session_id else {
            return self.base.select(ctx, candidates);
        };

        if let Some(mapped) = self.sessions.get(session) {
            if candidates.iter().any(|c| c.id == mapped) {
                return Some(mapped);
            }
        }

        let picked = self.base.select(ctx, candidates)?;
        self.sessions.insert(session.clone(), picked.clone());
        Some(picked)
    }
}

/// Prefers candidates in the caller's region
pub struct Geographic {
    base: Box<dyn SelectionStrategy>,
}

impl Geographic {
    pub fn new(base: Box<dyn SelectionStrategy>) -> Self {
        Geographic { base }
    }
}

impl SelectionStrategy for Geographic {
    fn name(&self) -> &'static str {
        "geographic"
    }

    fn select(&self, ctx: &RoutingContext, candidates: &[InstanceView]) -> Option<InstanceId> {
        if let Some(region) = &ctx.region {
            let local: Vec<InstanceView> = candidates
                .iter()
                .filter(|c| c.region.as_ref() == Some(region))
                .cloned()
                .collect();
            if !local.is_empty() {
                return self.base.select(ctx, &local);
            }
        }
        self.base.select(ctx, candidates)
    }
}

fn base_strategy(base: BaseStrategy) -> Box<dyn SelectionStrategy> {
    match base {
        BaseStrategy::RoundRobin => Box::new(RoundRobin::default()),
        BaseStrategy::Weighted => Box::new(Weighted::default()),
        BaseStrategy::LeastConnections => Box::new(LeastConnections),
    }
}

/// Create the configured strategy
pub fn build_strategy(config: &BalancerConfig) -> Box<dyn SelectionStrategy> {
    match config.strategy {
        StrategyKind::RoundRobin => Box::new(RoundRobin::default()),
        StrategyKind::Weighted => Box::new(Weighted::default()),
        StrategyKind::LeastConnections => Box::new(LeastConnections),
        StrategyKind::SessionAffinity => {
            Box::new(SessionAffinity::new(base_strategy(config.base), config))
        }
        StrategyKind::Geographic => Box::new(Geographic::new(base_strategy(config.base))),
    }
}
