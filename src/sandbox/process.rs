//! Process-based isolation primitive
//!
//! Runs each snippet as a child interpreter process inside a per-instance
//! working directory with a cleared environment. The child is killed when
//! the run future is dropped, which is how wall-clock timeouts terminate it.
//!
//! On unix the request's CPU and memory limits become `RLIMIT_CPU` and
//! `RLIMIT_AS` of the child. On Linux the peak resident set size is sampled
//! from `/proc/<pid>/status` while the child runs.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pool::InstanceId;
use crate::sandbox::executor::{
    ExecutionRequest, IsolationBackend, Language, RawOutcome, ResourceLimits,
};

/// Exit status the shell reports for SIGKILL, which is what the OOM killer sends
const SIGKILL_EXIT: i32 = 137;

/// How often the peak RSS sampler looks at a running child
const RSS_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// stderr fragments interpreters print when an allocation is refused
const ALLOCATION_FAILURES: &[&str] = &[
    "MemoryError",
    "cannot allocate",
    "Cannot allocate memory",
    "out of memory",
    "failed to allocate",
    "NoMemoryError",
];

/// Interpreter-per-run backend
pub struct ProcessBackend {
    /// Root under which each instance gets its own directory
    allowed_dir: PathBuf,
    /// Output beyond this many bytes per stream is truncated
    max_output_bytes: usize,
}

impl ProcessBackend {
    /// Create a new process backend
    pub fn new(allowed_dir: PathBuf, max_output_bytes: usize) -> Self {
        ProcessBackend {
            allowed_dir,
            max_output_bytes,
        }
    }

    /// Get the command for a language
    fn get_command(&self, language: Language) -> Result<(String, Vec<String>)> {
        match language {
            Language::Python => Ok(("python3".to_string(), vec!["-c".to_string()])),
            Language::JavaScript => Ok(("node".to_string(), vec!["-e".to_string()])),
            Language::Bash => Ok(("bash".to_string(), vec!["-c".to_string()])),
            Language::Ruby => Ok(("ruby".to_string(), vec!["-e".to_string()])),
            Language::TypeScript => {
                if which::which("deno").is_ok() {
                    Ok(("deno".to_string(), vec!["eval".to_string()]))
                } else if which::which("ts-node").is_ok() {
                    Ok(("ts-node".to_string(), vec!["-e".to_string()]))
                } else {
                    Err(Error::Sandbox(
                        "TypeScript runtime not found (deno or ts-node)".to_string(),
                    ))
                }
            }
        }
    }

    /// Working directory of an instance
    fn instance_dir(&self, instance: &InstanceId) -> Result<PathBuf> {
        if instance.contains(std::path::MAIN_SEPARATOR) || instance.contains("..") {
            return Err(Error::Sandbox(format!("Invalid instance id: {}", instance)));
        }
        Ok(self.allowed_dir.join(instance))
    }

    fn truncate(&self, bytes: &[u8]) -> String {
        let end = bytes.len().min(self.max_output_bytes);
        let mut text = String::from_utf8_lossy(&bytes[..end]).to_string();
        if bytes.len() > self.max_output_bytes {
            text.push_str("\n[output truncated]");
        }
        text
    }

    fn build_command(
        &self,
        request: &ExecutionRequest,
        working_dir: &Path,
    ) -> Result<Command> {
        let (cmd, args) = self.get_command(request.language)?;

        let mut command = Command::new(&cmd);
        command.args(&args).arg(&request.code);

        // bash -c binds the first trailing argument to $0
        if request.language == Language::Bash && !request.args.is_empty() {
            command.arg("sandbox");
        }
        command
            .args(&request.args)
            .current_dir(working_dir)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }
        for (key, value) in &request.env {
            command.env(key, value);
        }
        apply_limits(&mut command, &request.limits);

        Ok(command)
    }

    /// Whether a finished child ran out of CPU or memory
    fn exhausted(limits: &ResourceLimits, signal: Option<i32>, exit_code: Option<i32>, stderr: &str) -> bool {
        #[cfg(unix)]
        let killed = matches!(signal, Some(libc::SIGKILL) | Some(libc::SIGXCPU));
        #[cfg(not(unix))]
        let killed = signal.is_some();
        let refused = limits.memory_bytes.is_some()
            && exit_code != Some(0)
            && ALLOCATION_FAILURES.iter().any(|m| stderr.contains(m));
        killed || exit_code == Some(SIGKILL_EXIT) || refused
    }
}

/// Turn the request limits into rlimits applied between fork and exec
#[cfg(unix)]
fn apply_limits(command: &mut Command, limits: &ResourceLimits) {
    if limits.cpu_time.is_none() && limits.memory_bytes.is_none() {
        return;
    }

    // RLIMIT_CPU counts whole seconds; the hard limit follows one second later with SIGKILL
    let cpu_secs = limits.cpu_time.map(|cpu| {
        let secs = cpu.as_secs() + u64::from(cpu.subsec_nanos() > 0);
        secs.max(1)
    });
    let memory = limits.memory_bytes;

    // SAFETY: the closure only calls setrlimit, which is async-signal-safe
    unsafe {
        command.pre_exec(move || {
            if let Some(secs) = cpu_secs {
                check_rlimit(libc::setrlimit(libc::RLIMIT_CPU, &rlimit(secs, secs + 1)))?;
            }
            if let Some(bytes) = memory {
                check_rlimit(libc::setrlimit(libc::RLIMIT_AS, &rlimit(bytes, bytes)))?;
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_limits(_command: &mut Command, limits: &ResourceLimits) {
    if limits.cpu_time.is_some() || limits.memory_bytes.is_some() {
        warn!("Resource limits are not enforced on this platform");
    }
}

#[cfg(unix)]
fn rlimit(soft: u64, hard: u64) -> libc::rlimit {
    libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    }
}

#[cfg(unix)]
fn check_rlimit(ret: libc::c_int) -> std::io::Result<()> {
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Track the child's `VmHWM` until it exits. Leaves `peak` at 0 when unavailable.
async fn sample_peak_rss(pid: u32, peak: Arc<AtomicU64>) {
    let path = format!("/proc/{}/status", pid);
    loop {
        let Ok(status) = tokio::fs::read_to_string(&path).await else {
            return;
        };
        let Some(bytes) = parse_vm_hwm(&status) else {
            return;
        };
        peak.fetch_max(bytes, Ordering::Relaxed);
        tokio::time::sleep(RSS_SAMPLE_INTERVAL).await;
    }
}

/// `VmHWM:    1234 kB` in bytes
fn parse_vm_hwm(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmHWM:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn supports_language(&self, _language: Language) -> bool {
        true
    }

    async fn run(
        &self,
        instance: &InstanceId,
        request: &ExecutionRequest,
        timeout: Duration,
    ) -> Result<RawOutcome> {
        let working_dir = self.instance_dir(instance)?;
        tokio::fs::create_dir_all(&working_dir).await?;

        debug!(
            instance = %instance,
            language = %request.language,
            limits = ?request.limits,
            "Spawning sandboxed process"
        );

        let mut command = self.build_command(request, &working_dir)?;
        let start = Instant::now();

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock => {
                Error::ResourceExhausted(format!("Failed to spawn process: {}", e))
            }
            _ => Error::Sandbox(format!("Failed to spawn process: {}", e)),
        })?;

        let peak = Arc::new(AtomicU64::new(0));
        let sampler = child
            .id()
            .filter(|_| cfg!(target_os = "linux"))
            .map(|pid| tokio::spawn(sample_peak_rss(pid, peak.clone())));

        if let Some(mut stdin) = child.stdin.take() {
            if let Some(data) = &request.stdin {
                stdin.write_all(data.as_bytes()).await?;
            }
            // dropping stdin closes the pipe
        }

        // Dropping the future on timeout drops the child, and kill_on_drop reaps it
        let result = tokio::time::timeout(timeout, child.wait_with_output()).await;
        let duration = start.elapsed();
        if let Some(sampler) = sampler {
            sampler.abort();
        }
        let peak_memory = match peak.load(Ordering::Relaxed) {
            0 => None,
            bytes => Some(bytes),
        };

        match result {
            Ok(Ok(output)) => {
                let exit_code = output.status.code();
                #[cfg(unix)]
                let signal = {
                    use std::os::unix::process::ExitStatusExt;
                    output.status.signal()
                };
                #[cfg(not(unix))]
                let signal = None;

                let stderr = self.truncate(&output.stderr);
                let resource_exhausted = Self::exhausted(&request.limits, signal, exit_code, &stderr);
                if resource_exhausted {
                    warn!(instance = %instance, signal = ?signal, "Process ran out of resources");
                }

                Ok(RawOutcome {
                    exit_code,
                    stdout: self.truncate(&output.stdout),
                    stderr,
                    duration,
                    peak_memory,
                    timed_out: false,
                    resource_exhausted,
                })
            }
            Ok(Err(e)) => Err(Error::Sandbox(format!("Process error: {}", e))),
            Err(_) => {
                warn!(instance = %instance, "Execution timed out after {:?}", timeout);
                Ok(RawOutcome {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: "Execution timed out".to_string(),
                    duration: timeout,
                    peak_memory,
                    timed_out: true,
                    resource_exhausted: false,
                })
            }
        }
    }

    async fn probe(&self, instance: &InstanceId) -> Result<()> {
        let dir = self.instance_dir(instance)?;
        tokio::fs::create_dir_all(&dir).await?;

        let any_interpreter = ["python3", "node", "bash", "ruby", "deno"]
            .iter()
            .any(|bin| which::which(bin).is_ok());
        if !any_interpreter {
            return Err(Error::Sandbox("No interpreter found on PATH".to_string()));
        }
        Ok(())
    }
}
