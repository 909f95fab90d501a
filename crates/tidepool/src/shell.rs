//! Shell execution controller
//!
//! Owns the one long-lived shell-emulator session. Shell semantics (pipes,
//! redirection, the usual text utilities) live entirely in the engine; this
//! controller's job is limiting, directory scoping, and output shaping.
//! Each call gets a fresh pair of circuit breakers (loop iterations and
//! command count) built from the shared limits; when one trips, the call
//! fails with stderr naming the cap, which is how callers tell a runaway
//! script apart from a genuinely failing command.

use std::sync::Arc;

use tracing::{debug, info};

use crate::engine::{EngineError, ExecGuard, ShellEngine, ShellOutcome};
use crate::error::SandboxError;
use crate::limits::{ResourceLimits, cap_output};
use crate::sandbox::ExecutionResult;
use crate::workspace::Workspace;

/// Controller for the shell half of the sandbox.
pub struct ShellController {
    session: tokio::sync::Mutex<ShSession>,
    limits: Arc<ResourceLimits>,
    workspace: Arc<Workspace>,
}

struct ShSession {
    engine: Box<dyn ShellEngine>,
    booted: bool,
    /// Session default working directory (the virtual root). Per-call
    /// overrides are scoped to their call and never written back here.
    cwd: String,
}

impl std::fmt::Debug for ShellController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellController")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl ShellController {
    pub(crate) fn new(
        engine: Box<dyn ShellEngine>,
        workspace: Arc<Workspace>,
        limits: Arc<ResourceLimits>,
    ) -> Self {
        let cwd = workspace.virtual_root().to_string();
        Self {
            session: tokio::sync::Mutex::new(ShSession {
                engine,
                booted: false,
                cwd,
            }),
            limits,
            workspace,
        }
    }

    /// Run one command line, optionally in a workspace subdirectory.
    ///
    /// The override is validated through the bridge before the engine sees
    /// it; an escaping or missing directory fails the call without invoking
    /// the engine at all.
    pub async fn execute(&self, command: &str, cwd_override: Option<&str>) -> ExecutionResult {
        debug!(command_len = command.len(), "shell execute requested");
        let mut session = self.session.lock().await;

        if let Err(err) = self.ensure_booted(&mut session).await {
            return shell_failure(&err.to_string());
        }

        let cwd = match cwd_override {
            Some(dir) => match self.workspace.resolve_dir(dir).await {
                Ok(resolved) => resolved,
                Err(err) => return shell_failure(&SandboxError::from(err).to_string()),
            },
            None => session.cwd.clone(),
        };

        let guard = ExecGuard::new(&self.limits);
        match session.engine.run(command, &cwd, &guard).await {
            Ok(outcome) => self.shape(outcome),
            Err(EngineError::Limit(breach)) => shell_failure(&breach.to_string()),
            Err(err) => shell_failure(&err.to_string()),
        }
    }

    async fn ensure_booted(&self, session: &mut ShSession) -> Result<(), SandboxError> {
        if session.booted {
            return Ok(());
        }
        info!("booting shell emulator");
        session
            .engine
            .boot(Arc::clone(&self.workspace), &self.limits)
            .await
            .map_err(|err| SandboxError::EngineUnavailable(err.to_string()))?;
        session.booted = true;
        Ok(())
    }

    fn shape(&self, outcome: ShellOutcome) -> ExecutionResult {
        ExecutionResult {
            success: outcome.exit_code == 0,
            stdout: cap_output(&outcome.stdout, &self.limits),
            stderr: cap_output(&outcome.stderr, &self.limits),
            result: None,
            error: None,
            exit_code: Some(outcome.exit_code),
        }
    }
}

/// A call that failed before or outside normal command completion: exit 1,
/// with the message on both `stderr` and `error`.
fn shell_failure(message: &str) -> ExecutionResult {
    ExecutionResult {
        success: false,
        stdout: String::new(),
        stderr: message.to_string(),
        result: None,
        error: Some(message.to_string()),
        exit_code: Some(1),
    }
}
