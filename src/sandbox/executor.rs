//! Request/result types and the isolation primitive contract

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::error::{Error, Result};
use crate::pool::InstanceId;

/// Supported programming languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Bash,
    Ruby,
}

impl std::str::FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "python" | "py" | "python3" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "typescript" | "ts" => Ok(Language::TypeScript),
            "bash" | "sh" | "shell" => Ok(Language::Bash),
            "ruby" | "rb" => Ok(Language::Ruby),
            _ => Err(Error::Validation(format!(
                "Unsupported language: {}. Supported: python, javascript, typescript, bash, ruby",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::JavaScript => write!(f, "javascript"),
            Language::TypeScript => write!(f, "typescript"),
            Language::Bash => write!(f, "bash"),
            Language::Ruby => write!(f, "ruby"),
        }
    }
}

/// Resource ceilings handed to the isolation primitive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time budget
    #[serde(default, with = "humantime_serde")]
    pub cpu_time: Option<Duration>,
    /// Memory ceiling in bytes
    #[serde(default)]
    pub memory_bytes: Option<u64>,
}

/// Output of the upstream code-generation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeGenerationResult {
    /// Generated code
    pub code: String,
    /// Language as declared by the generator
    pub language: String,
    /// Optional resource hints
    #[serde(default)]
    pub resource_hints: Option<ResourceHints>,
}

/// Resource hints attached to generated code
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceHints {
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub cpu_time: Option<Duration>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
}

/// Request to execute code. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Correlation id used to tag logs and errors
    #[serde(default = "Uuid::new_v4")]
    pub correlation_id: Uuid,
    /// The code to execute
    pub code: String,
    /// Programming language
    pub language: Language,
    /// Command-line arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Standard input
    #[serde(default)]
    pub stdin: Option<String>,
    /// Environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// CPU and memory ceilings
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Wall-clock timeout; the service default applies when unset
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// How long to wait for a pool slot; the service default applies when unset
    #[serde(default, with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
    /// Session for sticky routing
    #[serde(default)]
    pub session_id: Option<String>,
    /// Caller region for geographic routing
    #[serde(default)]
    pub region: Option<String>,
    /// Whether the result may be memoized
    #[serde(default = "default_cacheable")]
    pub cacheable: bool,
}

fn default_cacheable() -> bool {
    true
}

impl ExecutionRequest {
    /// Create a new execution request
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        ExecutionRequest {
            correlation_id: Uuid::new_v4(),
            code: code.into(),
            language,
            args: Vec::new(),
            stdin: None,
            env: BTreeMap::new(),
            limits: ResourceLimits::default(),
            timeout: None,
            acquire_timeout: None,
            session_id: None,
            region: None,
            cacheable: true,
        }
    }

    /// Build a request from code-generation output
    pub fn from_generation(generated: CodeGenerationResult, defaults: &ExecutionConfig) -> Result<Self> {
        let language: Language = generated.language.parse()?;
        let hints = generated.resource_hints.unwrap_or_default();

        let mut request = ExecutionRequest::new(generated.code, language);
        request.timeout = Some(hints.timeout.unwrap_or(defaults.default_timeout));
        request.limits = ResourceLimits {
            cpu_time: hints.cpu_time,
            memory_bytes: hints.memory_bytes.or(defaults.default_memory_bytes),
        };
        Ok(request)
    }

    /// Set stdin
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Add a command-line argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the pool acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Set resource limits
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Pin to a routing session
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the caller region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Mark the request as side-effecting or non-deterministic
    pub fn uncacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }
}

/// What the isolation primitive reports back for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub peak_memory: Option<u64>,
    pub timed_out: bool,
    /// Killed or refused for lack of resources (OOM kill, EAGAIN)
    pub resource_exhausted: bool,
}

impl RawOutcome {
    /// Create a successful outcome
    pub fn success(stdout: impl Into<String>, duration: Duration) -> Self {
        RawOutcome {
            exit_code: Some(0),
            stdout: stdout.into(),
            duration,
            ..Default::default()
        }
    }

    /// Create a failed outcome
    pub fn failure(exit_code: i32, stderr: impl Into<String>, duration: Duration) -> Self {
        RawOutcome {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            duration,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.resource_exhausted
    }
}

/// Result of code execution. Created once per request and never mutated after return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Correlation id of the request this result answers
    pub correlation_id: Uuid,
    /// Whether execution was successful
    pub success: bool,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit code (if applicable)
    pub exit_code: Option<i32>,
    /// Execution time
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Peak memory usage in bytes (if available)
    pub peak_memory: Option<u64>,
    /// Whether this result was served from the cache
    pub cache_hit: bool,
    /// Instance that served the request; `None` exactly when `cache_hit` is set
    pub instance_id: Option<InstanceId>,
}

impl ExecutionResult {
    /// Build a result from a raw outcome served by `instance_id`
    pub fn from_outcome(correlation_id: Uuid, instance_id: InstanceId, outcome: RawOutcome) -> Self {
        ExecutionResult {
            correlation_id,
            success: outcome.is_success(),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
            duration: outcome.duration,
            peak_memory: outcome.peak_memory,
            cache_hit: false,
            instance_id: Some(instance_id),
        }
    }

    /// Copy of a stored result re-issued as a cache hit for another request
    pub fn as_cache_hit(&self, correlation_id: Uuid) -> Self {
        ExecutionResult {
            correlation_id,
            cache_hit: true,
            instance_id: None,
            ..self.clone()
        }
    }

    /// Get combined output
    pub fn combined_output(&self) -> String {
        let mut output = String::new();
        if !self.stdout.is_empty() {
            output.push_str(&self.stdout);
        }
        if !self.stderr.is_empty() {
            if !output.is_empty() {
                output.push_str("\n--- stderr ---\n");
            }
            output.push_str(&self.stderr);
        }
        output
    }
}

/// The opaque isolation primitive: `run(code, limits, timeout) -> RawOutcome`.
///
/// Implementations may use OS processes, containers, micro-VMs or a Wasm
/// runtime. The service only schedules, pools and protects calls to it.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Get the backend name
    fn name(&self) -> &str;

    /// Check if a language is supported
    fn supports_language(&self, language: Language) -> bool;

    /// Run the request's code on `instance` within `timeout`
    async fn run(
        &self,
        instance: &InstanceId,
        request: &ExecutionRequest,
        timeout: Duration,
    ) -> Result<RawOutcome>;

    /// Liveness probe for an instance
    async fn probe(&self, _instance: &InstanceId) -> Result<()> {
        Ok(())
    }
}
