//! Execution service - wires the components into one request path
//!
//! # Request path
//!
//! ```text
//! execute(request)
//!   validate ─▶ cache lookup ─▶ select instance ─▶ breaker permit
//!     ─▶ lease instance ─▶ backend.run (bounded by timeout)
//!     ─▶ breaker + metrics ─▶ release ─▶ cache store
//!   transient failure: back off, re-select avoiding the failed instance
//! ```
//!
//! Components are built once and passed in by handle; nothing here is
//! global, so every test gets a fresh service.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::balancer::LoadBalancer;
use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::cache::{CacheKey, CacheStats, ExecutionCache};
use crate::config::{validate_config, ExecutionConfig, ServiceConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::health::{check_fn, AlertKind, ComponentHealth, HealthMonitor};
use crate::metrics::{CapacitySignal, MetricsSnapshot, PerformanceMetrics};
use crate::pool::{InstanceId, LeaseOutcome, PoolStatus, ResourcePool};
use crate::processor::{AsyncProcessor, JobHandler, PendingExecution, ProcessorStats, ShutdownReport};
use crate::sandbox::{
    CodeGenerationResult, ExecutionRequest, ExecutionResult, IsolationBackend, RawOutcome,
};

/// The service's components, built but not yet wired
pub struct ServiceParts {
    pub pool: ResourcePool,
    pub cache: Arc<ExecutionCache>,
    pub breaker: Arc<CircuitBreaker>,
    pub balancer: Arc<LoadBalancer>,
    pub health: Arc<HealthMonitor>,
    pub metrics: Arc<PerformanceMetrics>,
    pub backend: Arc<dyn IsolationBackend>,
}

impl ServiceParts {
    /// Build every component from configuration
    pub fn from_config(config: &ServiceConfig, backend: Arc<dyn IsolationBackend>) -> Self {
        let pool = ResourcePool::new(config.pool.clone());
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let balancer = Arc::new(LoadBalancer::new(
            &config.balancer,
            pool.registry(),
            breaker.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(config.health.clone(), Some(breaker.clone())));

        ServiceParts {
            pool,
            cache: Arc::new(ExecutionCache::new(config.cache.clone())),
            breaker,
            balancer,
            health,
            metrics: Arc::new(PerformanceMetrics::new(config.metrics.clone())),
            backend,
        }
    }
}

/// Results of a batch, aligned with the submitted requests
#[derive(Debug)]
pub struct BatchSession {
    pub id: Uuid,
    pub results: Vec<Result<ExecutionResult>>,
}

impl BatchSession {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Per-request execution path shared by `execute` and the processor workers
struct ExecutionPipeline {
    config: ExecutionConfig,
    pool: ResourcePool,
    cache: Arc<ExecutionCache>,
    breaker: Arc<CircuitBreaker>,
    balancer: Arc<LoadBalancer>,
    health: Arc<HealthMonitor>,
    metrics: Arc<PerformanceMetrics>,
    backend: Arc<dyn IsolationBackend>,
}

impl ExecutionPipeline {
    fn validate(&self, request: &ExecutionRequest) -> Result<()> {
        if request.code.trim().is_empty() {
            return Err(Error::Validation("code is empty".to_string()));
        }
        if request.code.len() > self.config.max_code_bytes {
            return Err(Error::Validation(format!(
                "code is {} bytes, limit is {}",
                request.code.len(),
                self.config.max_code_bytes
            )));
        }
        if !self.backend.supports_language(request.language) {
            return Err(Error::Validation(format!(
                "{} backend does not support {}",
                self.backend.name(),
                request.language
            )));
        }
        if request.timeout == Some(Duration::ZERO) {
            return Err(Error::Validation("timeout must be positive".to_string()));
        }
        Ok(())
    }

    async fn run(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let correlation_id = request.correlation_id;
        let span = info_span!(
            "execute",
            correlation_id = %correlation_id,
            language = %request.language
        );

        async move {
            let result = self.run_inner(&request).await;
            match &result {
                Ok(r) => debug!(cache_hit = r.cache_hit, "Execution finished in {:?}", r.duration),
                Err(e) => warn!("Execution failed: {}", e),
            }
            result.map_err(|e| e.tagged(correlation_id))
        }
        .instrument(span)
        .await
    }

    async fn run_inner(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        if let Err(e) = self.validate(request) {
            self.metrics.record_error(e.kind());
            return Err(e);
        }

        let key = (request.cacheable && self.cache.is_enabled()).then(|| CacheKey::for_request(request));
        if let Some(key) = &key {
            if let Some(hit) = self.cache.get(key) {
                self.metrics.record_cache_hit();
                debug!("Cache hit for {}", key);
                return Ok(hit.as_cache_hit(request.correlation_id));
            }
            self.metrics.record_cache_miss();
        }

        let policy = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.retry_backoff)
            .with_max_interval(self.config.retry_max_backoff)
            .with_max_elapsed_time(None)
            .build();
        let avoid: Mutex<HashSet<InstanceId>> = Mutex::new(HashSet::new());
        let attempts = AtomicU32::new(0);
        let (avoid, attempts) = (&avoid, &attempts);

        let result = backoff::future::retry(policy, move || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.attempt(request, avoid).await {
                Ok(result) => Ok(result),
                Err(e) => {
                    self.metrics.record_error(e.kind());
                    if e.is_retryable() && attempt <= self.config.retry_limit {
                        debug!("Attempt {} failed, retrying: {}", attempt, e);
                        Err(backoff::Error::transient(e))
                    } else {
                        Err(backoff::Error::permanent(e))
                    }
                }
            }
        })
        .await?;

        if let Some(key) = key {
            self.cache.put_with_default_ttl(key, result.clone());
        }
        Ok(result)
    }

    /// One routed execution. Failed instances are added to `avoid`.
    async fn attempt(
        &self,
        request: &ExecutionRequest,
        avoid: &Mutex<HashSet<InstanceId>>,
    ) -> Result<ExecutionResult> {
        let instance = {
            let avoid = avoid.lock().clone();
            self.balancer.select_avoiding(request, &avoid)?
        };
        let avoid_instance = || {
            avoid.lock().insert(instance.clone());
        };

        let permit = self.breaker.try_acquire(&instance).inspect_err(|_| avoid_instance())?;

        let acquire_timeout = request.acquire_timeout.unwrap_or(self.config.acquire_timeout);
        let lease = self
            .pool
            .acquire_instance(&instance, acquire_timeout)
            .await
            .inspect_err(|_| avoid_instance())?;
        self.metrics.record_utilization(self.pool.status().utilization());

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let started = Instant::now();
        let run = tokio::time::timeout(timeout, self.backend.run(&instance, request, timeout)).await;
        let latency = started.elapsed();

        let outcome = match run {
            Ok(Ok(outcome)) if !outcome.timed_out => Ok(outcome),
            Ok(Ok(_)) | Err(_) => Err(Error::Timeout(timeout)),
            Ok(Err(e)) => Err(e),
        };

        let result = match outcome {
            Ok(outcome) if outcome.is_success() => {
                permit.success();
                self.metrics
                    .record_execution(&instance, latency, true, outcome.peak_memory);
                lease.release(LeaseOutcome::Success);
                Ok(ExecutionResult::from_outcome(
                    request.correlation_id,
                    instance.clone(),
                    outcome,
                ))
            }
            Ok(outcome) => {
                permit.failure();
                self.metrics
                    .record_execution(&instance, latency, false, outcome.peak_memory);
                lease.release(LeaseOutcome::Failure);
                Err(execution_error(outcome))
            }
            Err(e) => {
                permit.failure();
                self.metrics.record_execution(&instance, latency, false, None);
                lease.release(LeaseOutcome::Failure);
                if matches!(e, Error::Timeout(_)) {
                    warn!("{} timed out after {:?}, scheduling health re-check", instance, timeout);
                    self.health.schedule_recheck(&instance);
                }
                Err(e)
            }
        };

        self.metrics.record_utilization(self.pool.status().utilization());
        self.reap_retired();

        if result.as_ref().is_err_and(|e| e.is_retryable()) {
            avoid_instance();
        }
        result
    }

    /// Forget instances the pool has retired
    fn reap_retired(&self) {
        for id in self.pool.drain_retired() {
            self.health.unregister(&id);
            self.breaker.remove(&id);
            self.metrics.forget(&id);
            debug!("Unregistered retired instance {}", id);
        }
    }

    fn watch_instance(&self, id: &InstanceId) {
        let backend = self.backend.clone();
        let pool = self.pool.clone();
        let target = id.clone();
        self.health.register(
            id.clone(),
            check_fn(move || {
                let backend = backend.clone();
                let pool = pool.clone();
                let target = target.clone();
                async move {
                    let probed = backend.probe(&target).await;
                    pool.note_health_check(&target);
                    probed
                }
            }),
        );
        self.breaker.register(id);
    }
}

fn execution_error(outcome: RawOutcome) -> Error {
    Error::Execution {
        exit_code: outcome.exit_code,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        transient: outcome.resource_exhausted,
    }
}

#[async_trait]
impl JobHandler for ExecutionPipeline {
    async fn handle(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.run(request).await
    }
}

/// Aggregated service status
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub pool: PoolStatus,
    pub processor: ProcessorStats,
    pub cache: CacheStats,
    pub breakers: Vec<BreakerSnapshot>,
    pub strategy: &'static str,
    pub backend: String,
}

/// Scalable sandboxed execution service
pub struct ScalableSandboxService {
    config: ServiceConfig,
    pipeline: Arc<ExecutionPipeline>,
    processor: AsyncProcessor,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ScalableSandboxService {
    /// Build and wire a service. Must be called inside a Tokio runtime.
    pub fn new(config: ServiceConfig, backend: Arc<dyn IsolationBackend>) -> Result<Self> {
        let parts = ServiceParts::from_config(&config, backend);
        Self::from_parts(config, parts)
    }

    /// Wire pre-built components into a service
    pub fn from_parts(config: ServiceConfig, parts: ServiceParts) -> Result<Self> {
        let validation = validate_config(&config);
        if !validation.valid {
            return Err(Error::Config(validation.error_summary()));
        }
        for warning in &validation.warnings {
            warn!("Config warning at {}: {}", warning.path, warning.message);
        }

        let pipeline = Arc::new(ExecutionPipeline {
            config: config.execution.clone(),
            pool: parts.pool,
            cache: parts.cache,
            breaker: parts.breaker,
            balancer: parts.balancer,
            health: parts.health,
            metrics: parts.metrics,
            backend: parts.backend,
        });

        for id in pipeline.pool.registry().ids() {
            pipeline.watch_instance(&id);
        }

        let pool = pipeline.pool.clone();
        pipeline.health.on_alert(move |alert| {
            pool.set_health(&alert.target, alert.kind == AlertKind::Recovered);
        });

        let processor = AsyncProcessor::new(config.processor.clone(), pipeline.clone());

        info!(
            "Sandbox service ready: {} instances, {} routing, {} backend",
            pipeline.pool.registry().len(),
            pipeline.balancer.strategy_name(),
            pipeline.backend.name()
        );

        Ok(ScalableSandboxService {
            config,
            pipeline,
            processor,
            health_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Run one request on the caller's task
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.pipeline.run(request).await
    }

    /// Run code produced by a generation pipeline
    pub async fn execute_generated(&self, generated: CodeGenerationResult) -> Result<ExecutionResult> {
        let request = ExecutionRequest::from_generation(generated, &self.config.execution)
            .map_err(|e| self.record_error(e, Uuid::new_v4()))?;
        self.execute(request).await
    }

    /// Queue one request on the processor
    pub async fn submit(&self, request: ExecutionRequest) -> Result<PendingExecution> {
        let correlation_id = request.correlation_id;
        self.processor
            .submit(request)
            .await
            .map_err(|e| self.record_error(e, correlation_id))
    }

    /// Count an error raised outside the pipeline and tag it
    fn record_error(&self, err: Error, correlation_id: Uuid) -> Error {
        self.pipeline.metrics.record_error(err.kind());
        err.tagged(correlation_id)
    }

    /// Run requests through the processor, at most `batch_max_concurrency`
    /// at a time. One member failing never affects the others.
    pub async fn execute_batch(&self, requests: Vec<ExecutionRequest>) -> BatchSession {
        let id = Uuid::new_v4();
        let concurrency = self.config.execution.batch_max_concurrency.max(1);
        info!(batch = %id, "Running batch of {} requests", requests.len());

        let results: Vec<Result<ExecutionResult>> = stream::iter(requests)
            .map(|request| async move {
                let correlation_id = request.correlation_id;
                match self.submit(request).await {
                    // Pipeline errors are already counted; only a lost reply is new
                    Ok(pending) => pending.wait().await.map_err(|e| match e.kind() {
                        ErrorKind::Cancelled => self.record_error(e, correlation_id),
                        _ => e.tagged(correlation_id),
                    }),
                    Err(e) => Err(e),
                }
            })
            .buffered(concurrency)
            .collect()
            .await;

        let session = BatchSession { id, results };
        info!(
            batch = %id,
            "Batch finished: {} succeeded, {} failed",
            session.succeeded(),
            session.failed()
        );
        session
    }

    pub fn health(&self) -> BTreeMap<String, ComponentHealth> {
        self.pipeline.health.status()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.pipeline.metrics.snapshot()
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pipeline.pool.status()
    }

    pub fn processor_stats(&self) -> ProcessorStats {
        self.processor.stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.pipeline.cache.stats()
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            pool: self.pool_status(),
            processor: self.processor_stats(),
            cache: self.cache_stats(),
            breakers: self.pipeline.breaker.snapshot(),
            strategy: self.pipeline.balancer.strategy_name(),
            backend: self.pipeline.backend.name().to_string(),
        }
    }

    /// Autoscaling hint; the service never acts on it
    pub fn capacity_signal(&self) -> CapacitySignal {
        self.pipeline.metrics.capacity_signal()
    }

    /// Add instances and start monitoring them
    pub fn scale_up(&self, n: usize) -> Vec<InstanceId> {
        let added = self.pipeline.pool.scale_up(n);
        for id in &added {
            self.pipeline.watch_instance(id);
        }
        added
    }

    /// Remove or drain instances; returns how many were affected
    pub fn scale_down(&self, n: usize) -> usize {
        let affected = self.pipeline.pool.scale_down(n);
        self.pipeline.reap_retired();
        affected
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pipeline.pool
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.pipeline.breaker
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.pipeline.health
    }

    /// Start the periodic health checks
    pub fn start_background(&self) {
        let mut task = self.health_task.lock();
        if task.is_none() {
            *task = Some(self.pipeline.health.clone().spawn());
        }
    }

    /// Stop health checks and drain the processor
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        info!("Shutting down sandbox service");
        self.pipeline.health.shutdown();
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.processor.shutdown(grace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::config::{PoolConfig, StrategyKind};
    use crate::sandbox::{Language, Scripted, ScriptedBackend};

    fn config(workers: usize) -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.pool = PoolConfig {
            min_workers: 1,
            max_workers: workers,
            initial_workers: workers,
            ..Default::default()
        };
        config.breaker.failure_threshold = 3;
        config.execution.retry_limit = 0;
        config.execution.default_timeout = Duration::from_secs(1);
        config.execution.retry_backoff = Duration::from_millis(10);
        config
    }

    fn service(config: ServiceConfig, backend: Arc<ScriptedBackend>) -> ScalableSandboxService {
        ScalableSandboxService::new(config, backend).unwrap()
    }

    fn request(code: &str) -> ExecutionRequest {
        ExecutionRequest::new(code, Language::Python)
    }

    #[tokio::test]
    async fn test_cache_hit_on_repeat() {
        let backend = Arc::new(ScriptedBackend::echo());
        let service = service(config(2), backend.clone());

        let first = service.execute(request("print(42)")).await.unwrap();
        let second_request = request("print(42)");
        let second_id = second_request.correlation_id;
        let second = service.execute(second_request).await.unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(second.correlation_id, second_id);
        assert_eq!(second.stdout, first.stdout);
        assert_eq!(second.exit_code, first.exit_code);
        assert_eq!(second.duration, first.duration);
        assert_eq!(backend.total_calls(), 1);

        let metrics = service.metrics();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);
    }

    #[tokio::test]
    async fn test_uncacheable_requests_always_run() {
        let backend = Arc::new(ScriptedBackend::echo());
        let service = service(config(1), backend.clone());

        service.execute(request("x").uncacheable()).await.unwrap();
        service.execute(request("x").uncacheable()).await.unwrap();
        assert_eq!(backend.total_calls(), 2);
        assert_eq!(service.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn test_breaker_isolates_failing_instance() {
        let backend = Arc::new(ScriptedBackend::new(|instance, request| {
            if instance == "worker-0001" {
                Scripted::Fail {
                    exit_code: 1,
                    stderr: "boom".into(),
                }
            } else {
                Scripted::Succeed(request.code.clone())
            }
        }));
        let mut config = config(2);
        config.balancer.strategy = StrategyKind::SessionAffinity;
        let service = service(config, backend.clone());

        for i in 0..3 {
            let err = service
                .execute(request(&format!("run {}", i)).with_session("s1"))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Execution);
        }
        assert_eq!(service.breaker().state("worker-0001"), BreakerState::Open);
        assert!(service.breaker().try_acquire("worker-0001").is_err());

        // The 4th request never reaches the open instance
        let ok = service.execute(request("run 3").with_session("s1")).await.unwrap();
        assert_eq!(ok.instance_id.as_deref(), Some("worker-0002"));
        assert_eq!(backend.calls_to("worker-0001"), 3);

        let metrics = service.metrics();
        assert_eq!(metrics.errors_by_kind[&ErrorKind::Execution], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_isolates_timeout() {
        let backend = Arc::new(ScriptedBackend::new(|_, request| {
            if request.code == "job 2" {
                Scripted::Hang
            } else {
                Scripted::After(Duration::from_millis(10), Box::new(Scripted::Succeed(request.code.clone())))
            }
        }));
        let service = service(config(4), backend);

        let requests: Vec<ExecutionRequest> = (0..5).map(|i| request(&format!("job {}", i))).collect();
        let hung_id = requests[2].correlation_id;
        let batch = service.execute_batch(requests).await;

        assert_eq!(batch.len(), 5);
        assert_eq!(batch.succeeded(), 4);
        for (index, result) in batch.results.iter().enumerate() {
            match result {
                Ok(r) => assert_eq!(r.stdout, format!("job {}", index)),
                Err(e) => {
                    assert_eq!(index, 2);
                    assert_eq!(e.kind(), ErrorKind::Timeout);
                    assert_eq!(e.correlation_id(), Some(hung_id));
                }
            }
        }

        // The timed-out instance gets an out-of-band health check
        tokio::time::sleep(Duration::from_millis(1)).await;
        let checked: Vec<String> = service
            .health()
            .into_iter()
            .filter(|(_, h)| h.last_check_at.is_some())
            .map(|(id, _)| id)
            .collect();
        assert_eq!(checked.len(), 1);
        assert!(service
            .pool()
            .registry()
            .get(&checked[0])
            .unwrap()
            .last_health_check
            .is_some());
    }

    #[tokio::test]
    async fn test_rejected_submissions_are_counted() {
        let backend = Arc::new(ScriptedBackend::new(|_, request| {
            Scripted::After(Duration::from_millis(50), Box::new(Scripted::Succeed(request.code.clone())))
        }));
        let mut config = config(1);
        config.processor.workers = 1;
        config.processor.queue_capacity = 1;
        config.processor.submit_timeout = None;
        config.execution.batch_max_concurrency = 5;
        let service = service(config, backend);

        let requests: Vec<ExecutionRequest> = (0..5).map(|i| request(&format!("job {}", i))).collect();
        let batch = service.execute_batch(requests).await;
        let rejected = batch
            .results
            .iter()
            .filter(|r| r.as_ref().is_err_and(|e| e.kind() == ErrorKind::QueueFull))
            .count();
        assert!(rejected > 0);
        assert_eq!(
            service.metrics().errors_by_kind[&ErrorKind::QueueFull],
            rejected as u64
        );

        let generated = CodeGenerationResult {
            code: "print(1)".into(),
            language: "cobol".into(),
            resource_hints: None,
        };
        service.execute_generated(generated).await.unwrap_err();
        assert_eq!(service.metrics().errors_by_kind[&ErrorKind::Validation], 1);

        service.shutdown(Duration::from_secs(1)).await;
        service.submit(request("late")).await.unwrap_err();
        assert_eq!(service.metrics().errors_by_kind[&ErrorKind::ShuttingDown], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries_elsewhere() {
        let backend = Arc::new(ScriptedBackend::new(|instance, request| {
            if instance == "worker-0001" {
                Scripted::Exhausted
            } else {
                Scripted::Succeed(request.code.clone())
            }
        }));
        let mut config = config(2);
        config.execution.retry_limit = 2;
        config.balancer.strategy = StrategyKind::RoundRobin;
        let service = service(config, backend.clone());

        let result = service.execute(request("retry me")).await.unwrap();
        assert_eq!(result.instance_id.as_deref(), Some("worker-0002"));
        assert_eq!(backend.calls_to("worker-0001"), 1);
        assert_eq!(service.metrics().errors_by_kind[&ErrorKind::Execution], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_limit_bounds_attempts() {
        let backend = Arc::new(ScriptedBackend::new(|_, _| Scripted::Exhausted));
        let mut config = config(2);
        config.execution.retry_limit = 2;
        let service = service(config, backend.clone());

        let err = service.execute(request("never")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.is_retryable());
        assert_eq!(backend.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_validation_is_not_retried() {
        let backend = Arc::new(ScriptedBackend::echo());
        let mut config = config(1);
        config.execution.retry_limit = 3;
        let service = service(config, backend.clone());

        let bad = request("   ");
        let id = bad.correlation_id;
        let err = service.execute(bad).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.correlation_id(), Some(id));
        assert_eq!(backend.total_calls(), 0);

        let generated = CodeGenerationResult {
            code: "print(1)".into(),
            language: "cobol".into(),
            resource_hints: None,
        };
        let err = service.execute_generated(generated).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_no_instance_when_all_unhealthy() {
        let backend = Arc::new(ScriptedBackend::echo());
        let service = service(config(2), backend.clone());
        service.pool().set_health("worker-0001", false);
        service.pool().set_health("worker-0002", false);

        let err = service.execute(request("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoAvailableInstance);
        assert_eq!(backend.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_health_alerts_drive_pool_state() {
        let backend = Arc::new(ScriptedBackend::echo());
        let service = service(config(2), backend.clone());
        let monitor = service.health_monitor().clone();

        backend.set_probe_failing("worker-0001", true);
        for _ in 0..3 {
            monitor.check_target("worker-0001").await;
        }
        assert_eq!(service.pool_status().unhealthy, 1);
        assert_eq!(service.breaker().state("worker-0001"), BreakerState::Open);
        assert!(!service.health()["worker-0001"].healthy);

        backend.set_probe_failing("worker-0001", false);
        monitor.check_target("worker-0001").await;
        assert_eq!(service.pool_status().unhealthy, 0);
        assert!(service
            .pool()
            .registry()
            .get("worker-0001")
            .unwrap()
            .last_health_check
            .is_some());
    }

    #[tokio::test]
    async fn test_scaling_keeps_monitoring_in_sync() {
        let backend = Arc::new(ScriptedBackend::echo());
        let mut config = config(2);
        config.pool.max_workers = 4;
        let service = service(config, backend);

        let added = service.scale_up(5);
        assert_eq!(added.len(), 2);
        assert_eq!(service.health().len(), 4);

        for id in &added {
            service.execute(request(&format!("on {}", id)).uncacheable()).await.unwrap();
        }
        assert_eq!(service.metrics().instances.len(), 2);
        assert_eq!(service.scale_down(3), 3);
        assert_eq!(service.pool_status().total, 1);
        assert_eq!(service.health().len(), 1);
        let survivors: Vec<String> = service.health().into_keys().collect();
        assert!(service
            .metrics()
            .instances
            .keys()
            .all(|id| survivors.contains(id)));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let backend = Arc::new(ScriptedBackend::echo());
        let service = service(config(1), backend);
        service.start_background();

        let report = service.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.cancelled, 0);

        let err = service.submit(request("late")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShuttingDown);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = config(2);
        config.pool.min_workers = 5;
        let err = ScalableSandboxService::new(config, Arc::new(ScriptedBackend::echo()))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
