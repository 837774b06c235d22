//! Per-instance circuit breakers
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                                │ cooldown elapsed
//!     │ probe ok                       ▼
//!     └──────────────────────────── HalfOpen ──probe failed──▶ Open
//! ```
//!
//! Every breaker sits behind its own mutex, so transitions are atomic per
//! instance and unrelated instances never contend.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::error::{Error, Result};
use crate::pool::InstanceId;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    trips: u64,
}

impl BreakerEntry {
    fn new() -> Self {
        BreakerEntry {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            opened_at: None,
            probe_in_flight: false,
            trips: 0,
        }
    }

    /// Lazy `Open -> HalfOpen` once the cooldown has passed
    fn advance(&mut self, cooldown: Duration, id: &str) {
        if self.state == BreakerState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= cooldown {
                    self.state = BreakerState::HalfOpen;
                    self.probe_in_flight = false;
                    info!("Circuit for {} is half-open", id);
                }
            }
        }
    }

    fn open(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.probe_in_flight = false;
        self.trips += 1;
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.last_failure = None;
        self.opened_at = None;
        self.probe_in_flight = false;
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub instance: InstanceId,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    #[serde(with = "humantime_serde")]
    pub open_for: Option<Duration>,
    pub trips: u64,
}

/// Permission to make one call through a breaker.
///
/// Record the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). Dropping an unrecorded half-open probe frees
/// the probe slot without changing state.
#[must_use = "record the call outcome on the permit"]
pub struct CallPermit {
    instance: InstanceId,
    entry: Arc<Mutex<BreakerEntry>>,
    config: BreakerConfig,
    probe: bool,
    recorded: bool,
}

impl CallPermit {
    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.recorded = true;
        let mut entry = self.entry.lock();
        if self.probe {
            // A trip or reset while the probe ran wins over the probe
            if entry.state == BreakerState::HalfOpen {
                entry.close();
                info!("Circuit for {} closed after successful probe", self.instance);
            }
        } else if entry.state == BreakerState::Closed {
            entry.consecutive_failures = 0;
        }
    }

    pub fn failure(mut self) {
        self.recorded = true;
        let mut entry = self.entry.lock();
        if self.probe {
            if entry.state == BreakerState::HalfOpen {
                entry.open();
                warn!("Probe failed, circuit for {} reopened", self.instance);
            }
            return;
        }
        if entry.state != BreakerState::Closed {
            return;
        }

        let now = Instant::now();
        if let (Some(window), Some(last)) = (self.config.failure_window, entry.last_failure) {
            if now.duration_since(last) > window {
                entry.consecutive_failures = 0;
            }
        }
        entry.consecutive_failures += 1;
        entry.last_failure = Some(now);

        if entry.consecutive_failures >= self.config.failure_threshold {
            entry.open();
            warn!(
                "Circuit for {} opened after {} consecutive failures",
                self.instance, entry.consecutive_failures
            );
        } else {
            debug!(
                "Failure {}/{} on {}",
                entry.consecutive_failures, self.config.failure_threshold, self.instance
            );
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.probe && !self.recorded {
            let mut entry = self.entry.lock();
            if entry.state == BreakerState::HalfOpen {
                entry.probe_in_flight = false;
            }
        }
    }
}

/// Circuit breakers keyed by instance id
pub struct CircuitBreaker {
    config: BreakerConfig,
    entries: DashMap<InstanceId, Arc<Mutex<BreakerEntry>>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            config,
            entries: DashMap::new(),
        }
    }

    fn entry(&self, id: &str) -> Arc<Mutex<BreakerEntry>> {
        self.entries
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerEntry::new())))
            .clone()
    }

    /// Start tracking an instance in the closed state
    pub fn register(&self, id: &str) {
        self.entry(id);
    }

    /// Stop tracking an instance
    pub fn remove(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Ask to call `id`. Fails with `CircuitOpen` while the breaker is open
    /// or its half-open probe is already out.
    pub fn try_acquire(&self, id: &str) -> Result<CallPermit> {
        let entry = self.entry(id);
        let probe = {
            let mut guard = entry.lock();
            guard.advance(self.config.cooldown, id);
            match guard.state {
                BreakerState::Closed => false,
                BreakerState::Open => {
                    return Err(Error::CircuitOpen {
                        instance: id.to_string(),
                    })
                }
                BreakerState::HalfOpen => {
                    if guard.probe_in_flight {
                        return Err(Error::CircuitOpen {
                            instance: id.to_string(),
                        });
                    }
                    guard.probe_in_flight = true;
                    true
                }
            }
        };

        Ok(CallPermit {
            instance: id.to_string(),
            entry,
            config: self.config.clone(),
            probe,
            recorded: false,
        })
    }

    /// Current state, applying the cooldown transition. Unknown ids are closed.
    pub fn state(&self, id: &str) -> BreakerState {
        match self.entries.get(id) {
            Some(entry) => {
                let mut guard = entry.lock();
                guard.advance(self.config.cooldown, id);
                guard.state
            }
            None => BreakerState::Closed,
        }
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.state(id) == BreakerState::Open
    }

    /// Force the breaker open
    pub fn trip(&self, id: &str) {
        let entry = self.entry(id);
        let mut guard = entry.lock();
        if guard.state != BreakerState::Open {
            guard.open();
            warn!("Circuit for {} tripped", id);
        }
    }

    /// Force the breaker closed
    pub fn reset(&self, id: &str) {
        let entry = self.entry(id);
        entry.lock().close();
        info!("Circuit for {} reset", id);
    }

    /// State of every tracked breaker, ordered by instance id
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<BreakerSnapshot> = self
            .entries
            .iter()
            .map(|item| {
                let mut guard = item.value().lock();
                guard.advance(self.config.cooldown, item.key());
                BreakerSnapshot {
                    instance: item.key().clone(),
                    state: guard.state,
                    consecutive_failures: guard.consecutive_failures,
                    open_for: match guard.state {
                        BreakerState::Closed => None,
                        _ => guard.opened_at.map(|at| at.elapsed()),
                    },
                    trips: guard.trips,
                }
            })
            .collect();
        all.sort_by(|a, b| a.instance.cmp(&b.instance));
        all
    }
}
