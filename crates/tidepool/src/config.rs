//! Environment-driven configuration
//!
//! Deployments tune the sandbox through `TIDEPOOL_*` environment
//! variables. Unset variables fall back to defaults; a variable that is
//! set but unparseable is a startup error rather than a silent fallback.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::{InvalidLimit, ResourceLimits};

/// Host directory backing the workspace.
pub const ENV_WORKSPACE_ROOT: &str = "TIDEPOOL_WORKSPACE_ROOT";
/// Wall-clock timeout per execution, in milliseconds.
pub const ENV_TIMEOUT_MS: &str = "TIDEPOOL_TIMEOUT_MS";
/// Shell loop-iteration cap per execution.
pub const ENV_MAX_LOOP_ITERATIONS: &str = "TIDEPOOL_MAX_LOOP_ITERATIONS";
/// Shell command-count cap per execution.
pub const ENV_MAX_COMMAND_COUNT: &str = "TIDEPOOL_MAX_COMMAND_COUNT";
/// Retained bytes per captured output stream.
pub const ENV_MAX_OUTPUT_BYTES: &str = "TIDEPOOL_MAX_OUTPUT_BYTES";
/// Interpreter memory ceiling, in bytes.
pub const ENV_MAX_MEMORY_BYTES: &str = "TIDEPOOL_MAX_MEMORY_BYTES";

/// Why configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable was set to something the field cannot parse.
    #[error("invalid value for {var}: {value:?}")]
    Invalid {
        /// Name of the offending environment variable.
        var: &'static str,
        /// The value as found in the environment.
        value: String,
    },
    /// A variable was set to non-unicode bytes.
    #[error("{var} is not valid unicode")]
    NotUnicode {
        /// Name of the offending environment variable.
        var: &'static str,
    },
    /// The loaded limits fail validation (for example a zero cap).
    #[error(transparent)]
    InvalidLimit(#[from] InvalidLimit),
}

/// Loaded sandbox configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Host directory backing the workspace (created if missing).
    pub workspace_root: PathBuf,
    /// Resource limits applied to every execution.
    pub limits: ResourceLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("workspace"),
            limits: ResourceLimits::default(),
        }
    }
}

impl SandboxConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(|var| match env::var(var) {
            Ok(value) => Ok(Some(value)),
            Err(env::VarError::NotPresent) => Ok(None),
            Err(env::VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode { var }),
        })
    }

    fn load(
        lookup: impl Fn(&'static str) -> Result<Option<String>, ConfigError>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(root) = lookup(ENV_WORKSPACE_ROOT)? {
            config.workspace_root = PathBuf::from(root);
        }
        if let Some(ms) = parse(ENV_TIMEOUT_MS, &lookup)? {
            config.limits.timeout = Duration::from_millis(ms);
        }
        if let Some(cap) = parse(ENV_MAX_LOOP_ITERATIONS, &lookup)? {
            config.limits.max_loop_iterations = cap;
        }
        if let Some(cap) = parse(ENV_MAX_COMMAND_COUNT, &lookup)? {
            config.limits.max_command_count = cap;
        }
        if let Some(cap) = parse(ENV_MAX_OUTPUT_BYTES, &lookup)? {
            config.limits.max_output_bytes = cap;
        }
        if let Some(cap) = parse(ENV_MAX_MEMORY_BYTES, &lookup)? {
            config.limits.max_memory_bytes = cap;
        }

        config.limits.validate()?;
        Ok(config)
    }
}

fn parse<T: FromStr>(
    var: &'static str,
    lookup: &impl Fn(&'static str) -> Result<Option<String>, ConfigError>,
) -> Result<Option<T>, ConfigError> {
    match lookup(var)? {
        Some(value) => match value.parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(ConfigError::Invalid { var, value }),
        },
        None => Ok(None),
    }
}
