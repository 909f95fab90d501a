//! Interface contract between the controllers and the embedded interpreters
//!
//! The interpreters themselves live outside this crate; an embedder links a
//! WASM-hosted Python runtime and a shell emulator in through the
//! [`PythonEngine`] and [`ShellEngine`] traits. The controllers only rely on
//! the contract here: engines funnel all filesystem access through the
//! [`Workspace`](crate::workspace::Workspace) handle given at boot, poll the
//! interruption flag at safe points, and report caps through the guard.
//!
//! [`scripted`] provides deterministic in-crate engines for tests and for
//! embedders that want to exercise their integration without a real runtime.

pub mod scripted;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::limits::ResourceLimits;
use crate::workspace::Workspace;

/// Errors surfaced by an embedded engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// First-use setup failed, or no engine is linked at all
    #[error("engine boot failed: {0}")]
    Boot(String),
    /// The interruption flag was observed at a poll point
    #[error("execution interrupted")]
    Interrupted,
    /// An execution cap tripped at a check point
    #[error(transparent)]
    Limit(#[from] LimitBreach),
    /// The privileged package fetch failed
    #[error("package install failed: {0}")]
    Install(String),
    /// Engine-internal failure outside program semantics
    #[error("engine failure: {0}")]
    Internal(String),
}

/// An execution cap that tripped during a shell call.
///
/// The message names the cap, which callers rely on to tell a runaway
/// script apart from a genuinely failing command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{limit} limit exceeded (cap: {cap})")]
pub struct LimitBreach {
    /// Name of the cap that tripped.
    pub limit: &'static str,
    /// Configured value of that cap.
    pub cap: u64,
}

/// Raw outcome of one Python evaluation.
///
/// `value` is the textual repr of the last evaluated expression, absent when
/// the code ends in a statement. `fault` carries an uncaught exception; a
/// fault still produces an outcome, not an [`EngineError`].
#[derive(Debug, Clone, Default)]
pub struct PythonOutcome {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Repr of the last evaluated expression, if any.
    pub value: Option<String>,
    /// Uncaught exception, if the program raised one.
    pub fault: Option<PythonFault>,
}

/// An uncaught exception from the Python runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonFault {
    /// Exception type name (e.g. `ZeroDivisionError`).
    pub kind: String,
    /// Exception message, verbatim.
    pub message: String,
}

impl PythonFault {
    /// Render as `Kind: message`, the shape callers see in `error`.
    pub fn render(&self) -> String {
        if self.message.is_empty() {
            self.kind.clone()
        } else {
            format!("{}: {}", self.kind, self.message)
        }
    }
}

/// Raw outcome of one shell command or pipeline.
#[derive(Debug, Clone, Default)]
pub struct ShellOutcome {
    /// Exit code of the top-level pipeline.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl ShellOutcome {
    /// A zero-exit outcome with the given stdout.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A non-zero outcome with the given stderr.
    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Shared interruption flag polled by the Python runtime at safe points.
///
/// The controller arms a timer that trips the flag when the wall-clock
/// timeout elapses; the engine observes it only where its execution loop
/// polls. Code that never yields control runs to completion regardless,
/// which is the documented cost of cooperative scheduling.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    tripped: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Create an untripped handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the flag. Idempotent.
    pub fn trip(&self) {
        self.tripped.store(true, Ordering::Relaxed);
    }

    /// Whether the flag has been tripped.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Relaxed)
    }

    /// Spawn a timer that trips the flag after `after`.
    ///
    /// The caller aborts the returned handle when the execution completes
    /// first, so a finished call never leaves a stray trip behind.
    pub fn arm(&self, after: Duration) -> tokio::task::JoinHandle<()> {
        let flag = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            flag.trip();
        })
    }
}

/// Per-call circuit breakers for shell interpretation.
///
/// The engine ticks the loop counter once per loop-body iteration and the
/// command counter once per executed command; the first tick past a cap
/// reports a [`LimitBreach`] naming it.
#[derive(Debug)]
pub struct ExecGuard {
    max_loop_iterations: u64,
    max_command_count: u64,
    loop_iterations: AtomicU64,
    commands: AtomicU64,
}

impl ExecGuard {
    /// Build a guard for one call from the shared limits.
    pub fn new(limits: &ResourceLimits) -> Self {
        Self {
            max_loop_iterations: limits.max_loop_iterations,
            max_command_count: limits.max_command_count,
            loop_iterations: AtomicU64::new(0),
            commands: AtomicU64::new(0),
        }
    }

    /// Record one loop-body iteration.
    pub fn tick_loop(&self) -> Result<(), LimitBreach> {
        let seen = self.loop_iterations.fetch_add(1, Ordering::Relaxed) + 1;
        if seen > self.max_loop_iterations {
            return Err(LimitBreach {
                limit: "max_loop_iterations",
                cap: self.max_loop_iterations,
            });
        }
        Ok(())
    }

    /// Record one executed command.
    pub fn tick_command(&self) -> Result<(), LimitBreach> {
        let seen = self.commands.fetch_add(1, Ordering::Relaxed) + 1;
        if seen > self.max_command_count {
            return Err(LimitBreach {
                limit: "max_command_count",
                cap: self.max_command_count,
            });
        }
        Ok(())
    }

    /// Loop iterations observed so far.
    pub fn loop_iterations(&self) -> u64 {
        self.loop_iterations.load(Ordering::Relaxed)
    }

    /// Commands observed so far.
    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }
}

/// Embedded Python runtime, owned by the Python controller.
///
/// Implementations are session-stateful: variables and installed packages
/// persist across `eval` calls until the engine is dropped.
#[async_trait]
pub trait PythonEngine: Send {
    /// First-use setup: start the runtime and mount the workspace.
    ///
    /// All filesystem access inside the engine must go through `workspace`;
    /// the engine never receives a raw host filesystem handle.
    async fn boot(
        &mut self,
        workspace: Arc<Workspace>,
        limits: &ResourceLimits,
    ) -> Result<(), EngineError>;

    /// Evaluate one snippet, polling `interrupt` at safe points.
    ///
    /// Observing a trip aborts with [`EngineError::Interrupted`]. A
    /// completed outcome is final even if the flag tripped after the last
    /// poll.
    async fn eval(
        &mut self,
        code: &str,
        interrupt: InterruptHandle,
    ) -> Result<PythonOutcome, EngineError>;

    /// Fetch and install one package over the privileged channel.
    ///
    /// This is the only network-capable path in the system; sandboxed code
    /// itself has no network access.
    async fn install(&mut self, package: &str) -> Result<(), EngineError>;
}

/// Embedded shell emulator, owned by the shell controller.
#[async_trait]
pub trait ShellEngine: Send {
    /// First-use setup: start the emulator and mount the workspace.
    async fn boot(
        &mut self,
        workspace: Arc<Workspace>,
        limits: &ResourceLimits,
    ) -> Result<(), EngineError>;

    /// Run one command line in `cwd`, ticking `guard` at check points.
    ///
    /// A breach aborts interpretation via [`EngineError::Limit`]; partial
    /// output produced before the breach may be discarded.
    async fn run(
        &mut self,
        command: &str,
        cwd: &str,
        guard: &ExecGuard,
    ) -> Result<ShellOutcome, EngineError>;
}

/// Placeholder used when no Python runtime has been linked.
///
/// Boot always fails, so executions report a structured engine-unavailable
/// result instead of crashing the transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredPython;

#[async_trait]
impl PythonEngine for UnconfiguredPython {
    async fn boot(
        &mut self,
        _workspace: Arc<Workspace>,
        _limits: &ResourceLimits,
    ) -> Result<(), EngineError> {
        Err(EngineError::Boot(
            "no python engine configured; link one when building the sandbox".to_string(),
        ))
    }

    async fn eval(
        &mut self,
        _code: &str,
        _interrupt: InterruptHandle,
    ) -> Result<PythonOutcome, EngineError> {
        Err(EngineError::Boot(
            "no python engine configured; link one when building the sandbox".to_string(),
        ))
    }

    async fn install(&mut self, _package: &str) -> Result<(), EngineError> {
        Err(EngineError::Boot(
            "no python engine configured; link one when building the sandbox".to_string(),
        ))
    }
}

/// Placeholder used when no shell emulator has been linked.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredShell;

#[async_trait]
impl ShellEngine for UnconfiguredShell {
    async fn boot(
        &mut self,
        _workspace: Arc<Workspace>,
        _limits: &ResourceLimits,
    ) -> Result<(), EngineError> {
        Err(EngineError::Boot(
            "no shell engine configured; link one when building the sandbox".to_string(),
        ))
    }

    async fn run(
        &mut self,
        _command: &str,
        _cwd: &str,
        _guard: &ExecGuard,
    ) -> Result<ShellOutcome, EngineError> {
        Err(EngineError::Boot(
            "no shell engine configured; link one when building the sandbox".to_string(),
        ))
    }
}
