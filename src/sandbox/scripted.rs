//! Deterministic in-memory isolation primitive
//!
//! Decides each run's outcome with a caller-supplied closure instead of
//! running anything. Used by `--dry-run` and throughout the test suite.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::pool::InstanceId;
use crate::sandbox::executor::{ExecutionRequest, IsolationBackend, Language, RawOutcome};

/// Outcome a scripted run should produce
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Exit 0 with this stdout
    Succeed(String),
    /// Exit non-zero with this stderr
    Fail { exit_code: i32, stderr: String },
    /// Never finish; the caller's timeout has to cut it off
    Hang,
    /// Report resource exhaustion
    Exhausted,
    /// Backend-level failure
    Error(String),
    /// Sleep, then produce the inner outcome
    After(Duration, Box<Scripted>),
}

type Behavior = dyn Fn(&InstanceId, &ExecutionRequest) -> Scripted + Send + Sync;

/// Scripted backend
pub struct ScriptedBackend {
    behavior: Box<Behavior>,
    calls: DashMap<InstanceId, u64>,
    failing_probes: DashSet<InstanceId>,
    total_calls: AtomicU64,
}

impl ScriptedBackend {
    /// Create a backend whose outcomes come from `behavior`
    pub fn new<F>(behavior: F) -> Self
    where
        F: Fn(&InstanceId, &ExecutionRequest) -> Scripted + Send + Sync + 'static,
    {
        ScriptedBackend {
            behavior: Box::new(behavior),
            calls: DashMap::new(),
            failing_probes: DashSet::new(),
            total_calls: AtomicU64::new(0),
        }
    }

    /// Backend that echoes the submitted code as stdout
    pub fn echo() -> Self {
        Self::new(|_, request| Scripted::Succeed(request.code.clone()))
    }

    /// Number of runs dispatched to `instance`
    pub fn calls_to(&self, instance: &str) -> u64 {
        self.calls.get(instance).map(|c| *c).unwrap_or(0)
    }

    /// Number of runs dispatched to any instance
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::SeqCst)
    }

    /// Make probes of `instance` fail (or succeed again)
    pub fn set_probe_failing(&self, instance: &str, failing: bool) {
        if failing {
            self.failing_probes.insert(instance.to_string());
        } else {
            self.failing_probes.remove(instance);
        }
    }

    async fn play(script: Scripted) -> Result<RawOutcome> {
        let mut script = script;
        let mut waited = Duration::ZERO;
        loop {
            match script {
                Scripted::After(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    waited += delay;
                    script = *inner;
                }
                Scripted::Succeed(stdout) => return Ok(RawOutcome::success(stdout, waited)),
                Scripted::Fail { exit_code, stderr } => {
                    return Ok(RawOutcome::failure(exit_code, stderr, waited))
                }
                Scripted::Exhausted => {
                    return Ok(RawOutcome {
                        exit_code: Some(137),
                        stderr: "killed: out of memory".to_string(),
                        duration: waited,
                        resource_exhausted: true,
                        ..Default::default()
                    })
                }
                Scripted::Error(message) => return Err(Error::Sandbox(message)),
                Scripted::Hang => return std::future::pending::<Result<RawOutcome>>().await,
            }
        }
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::echo()
    }
}

#[async_trait]
impl IsolationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports_language(&self, _language: Language) -> bool {
        true
    }

    async fn run(
        &self,
        instance: &InstanceId,
        request: &ExecutionRequest,
        _timeout: Duration,
    ) -> Result<RawOutcome> {
        *self.calls.entry(instance.clone()).or_insert(0) += 1;
        self.total_calls.fetch_add(1, Ordering::SeqCst);

        let script = (self.behavior)(instance, request);
        Self::play(script).await
    }

    async fn probe(&self, instance: &InstanceId) -> Result<()> {
        if self.failing_probes.contains(instance) {
            return Err(Error::Sandbox(format!("probe failed for {}", instance)));
        }
        Ok(())
    }
}
