//! Sandbox module - the isolation primitive and the request/result model
//!
//! The service treats isolation as an opaque capability behind
//! [`IsolationBackend`]. Two backends ship with the crate:
//! - Process: child interpreter per run, killed on timeout
//! - Scripted: deterministic in-memory outcomes for tests and dry runs

mod executor;
mod process;
mod scripted;

pub use executor::{
    CodeGenerationResult, ExecutionRequest, ExecutionResult, IsolationBackend, Language,
    RawOutcome, ResourceHints, ResourceLimits,
};
pub use process::ProcessBackend;
pub use scripted::{Scripted, ScriptedBackend};

use std::sync::Arc;

use crate::config::{BackendKind, SandboxConfig};

/// Create a backend based on the configuration
pub fn create_backend(config: &SandboxConfig) -> Arc<dyn IsolationBackend> {
    match config.backend {
        BackendKind::Process => Arc::new(ProcessBackend::new(
            config.allowed_dir.clone(),
            config.max_output_bytes,
        )),
        BackendKind::Scripted => Arc::new(ScriptedBackend::echo()),
    }
}
