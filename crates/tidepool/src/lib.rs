//! Tidepool: Sandboxed Execution Coordinator
//!
//! Tidepool gives agents a persistent, isolated place to run Python and
//! shell code. Submitted snippets execute inside embedded interpreter
//! sessions against a host-backed workspace directory, under wall-clock
//! and resource limits, and every run comes back as a structured result
//! rather than a crash or a hang.

mod imports;
mod limits;
mod python;
mod sandbox;
mod shell;
mod workspace;

pub mod config;
pub mod engine;
pub mod error;

pub use config::{ConfigError, SandboxConfig};
pub use error::SandboxError;
pub use limits::{InvalidLimit, ResourceLimits};
pub use sandbox::{
    ExecOptions, ExecutionRequest, ExecutionResult, Language, PackageInstallOutcome, Sandbox,
    SandboxBuilder,
};
pub use workspace::{FileEntry, FsError, Workspace};
