//! Execution metrics and the capacity signal
//!
//! Counters are atomics so the hot path never waits on a lock. Latency and
//! utilization samples sit in time-bounded queues behind short-held
//! mutexes; percentiles are computed on read.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::MetricsConfig;
use crate::error::ErrorKind;
use crate::pool::InstanceId;

/// Pool sizing hint derived from sustained utilization.
///
/// Nothing in this crate acts on it; an external autoscaler calls
/// `scale_up` / `scale_down` based on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacitySignal {
    ScaleUp,
    ScaleDown,
    Steady,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record(&self, success: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone)]
struct Sample {
    at: Instant,
    instance: InstanceId,
    latency: Duration,
    success: bool,
    peak_memory: Option<u64>,
}

/// Aggregates over the rolling window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub count: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub success_rate: Option<f64>,
    #[serde(with = "humantime_serde")]
    pub p50: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub p95: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub p99: Option<Duration>,
    pub mean_peak_memory: Option<u64>,
}

impl WindowStats {
    fn from_samples<'a>(samples: impl Iterator<Item = &'a Sample>) -> Self {
        let mut stats = WindowStats::default();
        let mut latencies = Vec::new();
        let mut memory_total: u128 = 0;
        let mut memory_count: u64 = 0;

        for sample in samples {
            stats.count += 1;
            if sample.success {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
            latencies.push(sample.latency);
            if let Some(peak) = sample.peak_memory {
                memory_total += u128::from(peak);
                memory_count += 1;
            }
        }

        if stats.count > 0 {
            stats.success_rate = Some(stats.succeeded as f64 / stats.count as f64);
        }
        latencies.sort_unstable();
        stats.p50 = percentile(&latencies, 0.50);
        stats.p95 = percentile(&latencies, 0.95);
        stats.p99 = percentile(&latencies, 0.99);
        if memory_count > 0 {
            stats.mean_peak_memory = Some((memory_total / u128::from(memory_count)) as u64);
        }
        stats
    }
}

/// Nearest-rank percentile over sorted values
fn percentile(sorted: &[Duration], p: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

/// Lifetime and windowed figures for one instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceMetrics {
    pub executions: u64,
    pub failures: u64,
    pub window: WindowStats,
}

/// Point-in-time metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub success_rate: Option<f64>,
    pub window: WindowStats,
    pub instances: BTreeMap<InstanceId, InstanceMetrics>,
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub utilization: Option<f64>,
    pub capacity: CapacitySignal,
}

/// Performance metrics recorder
pub struct PerformanceMetrics {
    config: MetricsConfig,
    global: Counters,
    instances: DashMap<InstanceId, Arc<Counters>>,
    errors: DashMap<ErrorKind, AtomicU64>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    samples: Mutex<VecDeque<Sample>>,
    utilization: Mutex<VecDeque<(Instant, f64)>>,
}

impl PerformanceMetrics {
    pub fn new(config: MetricsConfig) -> Self {
        PerformanceMetrics {
            config,
            global: Counters::default(),
            instances: DashMap::new(),
            errors: DashMap::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::new()),
            utilization: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one finished execution
    pub fn record_execution(
        &self,
        instance: &str,
        latency: Duration,
        success: bool,
        peak_memory: Option<u64>,
    ) {
        self.global.record(success);
        self.instances
            .entry(instance.to_string())
            .or_default()
            .record(success);

        let now = Instant::now();
        let mut samples = self.samples.lock();
        samples.push_back(Sample {
            at: now,
            instance: instance.to_string(),
            latency,
            success,
            peak_memory,
        });
        self.trim_samples(&mut samples, now);
    }

    /// Count an error, retried or not
    pub fn record_error(&self, kind: ErrorKind) {
        self.errors
            .entry(kind)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the pool's busy share, in `[0, 1]`
    pub fn record_utilization(&self, utilization: f64) {
        let now = Instant::now();
        let mut samples = self.utilization.lock();
        samples.push_back((now, utilization.clamp(0.0, 1.0)));

        // Keep one sample at or before the window start; it covers the window's first stretch
        if let Some(start) = now.checked_sub(self.config.capacity_window) {
            while samples.len() >= 2 && samples[1].0 <= start {
                samples.pop_front();
            }
        }
        while samples.len() > self.config.max_samples.max(1) {
            samples.pop_front();
        }
    }

    fn trim_samples(&self, samples: &mut VecDeque<Sample>, now: Instant) {
        if let Some(start) = now.checked_sub(self.config.window) {
            while samples.front().is_some_and(|s| s.at < start) {
                samples.pop_front();
            }
        }
        while samples.len() > self.config.max_samples {
            samples.pop_front();
        }
    }

    /// Scale hint from utilization sustained over `capacity_window`
    pub fn capacity_signal(&self) -> CapacitySignal {
        let now = Instant::now();
        let samples = self.utilization.lock();
        let Some(start) = now.checked_sub(self.config.capacity_window) else {
            return CapacitySignal::Steady;
        };

        // Not enough history to call anything sustained
        let Some(anchor) = samples.iter().rposition(|(at, _)| *at <= start) else {
            return CapacitySignal::Steady;
        };

        let covering = samples.iter().skip(anchor).map(|(_, u)| *u);
        let (mut all_high, mut all_low) = (true, true);
        for utilization in covering {
            all_high &= utilization > self.config.scale_up_threshold;
            all_low &= utilization < self.config.scale_down_threshold;
        }

        if all_high {
            CapacitySignal::ScaleUp
        } else if all_low {
            CapacitySignal::ScaleDown
        } else {
            CapacitySignal::Steady
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let samples: Vec<Sample> = {
            let mut samples = self.samples.lock();
            self.trim_samples(&mut samples, now);
            samples.iter().cloned().collect()
        };

        let mut instances = BTreeMap::new();
        for entry in self.instances.iter() {
            let id = entry.key();
            instances.insert(
                id.clone(),
                InstanceMetrics {
                    executions: entry.total.load(Ordering::Relaxed),
                    failures: entry.failed.load(Ordering::Relaxed),
                    window: WindowStats::from_samples(samples.iter().filter(|s| &s.instance == id)),
                },
            );
        }

        let errors_by_kind = self
            .errors
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect();

        let total = self.global.total.load(Ordering::Relaxed);
        let succeeded = self.global.succeeded.load(Ordering::Relaxed);
        // Released before capacity_signal takes the same lock
        let utilization = self.utilization.lock().back().map(|(_, u)| *u);

        MetricsSnapshot {
            total,
            succeeded,
            failed: self.global.failed.load(Ordering::Relaxed),
            success_rate: (total > 0).then(|| succeeded as f64 / total as f64),
            window: WindowStats::from_samples(samples.iter()),
            instances,
            errors_by_kind,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            utilization,
            capacity: self.capacity_signal(),
        }
    }

    /// Drop the per-instance counters of a removed instance
    pub fn forget(&self, instance: &str) {
        self.instances.remove(instance);
    }

    /// Errors recorded for one kind
    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.errors
            .get(&kind)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}
