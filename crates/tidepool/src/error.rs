//! Error taxonomy for the sandbox coordinator
//!
//! Every fault below is caught at a controller boundary and folded into a
//! structured [`ExecutionResult`](crate::sandbox::ExecutionResult) before it
//! can reach the transport layer. The enum exists so callers and tests can
//! distinguish failure kinds; it is not a panic path.

use thiserror::Error;

use crate::limits::InvalidLimit;
use crate::workspace::FsError;

/// Errors produced by sandbox operations
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Path escaped the workspace; the operation was not applied
    #[error("security violation: {0} resolves outside the workspace")]
    SecurityViolation(String),
    /// Wall-clock timeout tripped at an interpreter poll point
    #[error("execution timed out after {timeout_ms}ms")]
    ExecutionTimeout {
        /// The configured timeout that was exceeded.
        timeout_ms: u64,
    },
    /// A loop-iteration or command-count cap tripped
    #[error("resource limit exceeded: {limit} (cap: {cap})")]
    ResourceLimitExceeded {
        /// Name of the cap that tripped.
        limit: &'static str,
        /// Configured value of that cap.
        cap: u64,
    },
    /// Uncaught interpreter exception or engine fault, message verbatim
    #[error("interpreter error: {0}")]
    Interpreter(String),
    /// Install failure for a single package
    #[error("failed to install {package}: {message}")]
    PackageInstall {
        /// Package that failed to install.
        package: String,
        /// Installer message, verbatim.
        message: String,
    },
    /// No engine is linked for the requested language, or it failed to boot
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),
    /// Filesystem failure unrelated to containment
    #[error(transparent)]
    Filesystem(FsError),
    /// Rejected resource limit configuration
    #[error(transparent)]
    InvalidLimit(#[from] InvalidLimit),
}

impl From<FsError> for SandboxError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::SecurityViolation(path) => Self::SecurityViolation(path),
            other => Self::Filesystem(other),
        }
    }
}
