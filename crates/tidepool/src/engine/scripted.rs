//! Deterministic engines for exercising the controllers
//!
//! These engines play back enqueued behaviors instead of interpreting code,
//! while honoring the full engine contract: they poll the interruption flag
//! at their suspension points, tick the execution guard at their check
//! points, and funnel nothing past the workspace bridge. Tests use them to
//! drive the coordinator through timeouts, cap trips, engine faults, and
//! session bookkeeping without linking a real runtime.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::{
    EngineError, ExecGuard, InterruptHandle, PythonEngine, PythonOutcome, ShellEngine,
    ShellOutcome,
};
use crate::limits::ResourceLimits;
use crate::workspace::Workspace;

/// Shared observation log for a scripted engine.
///
/// Controllers take ownership of their engine, so tests grab a log handle
/// with [`ScriptedPython::log`] / [`ScriptedShell::log`] before handing the
/// engine over, then assert on what the controller actually drove.
#[derive(Debug, Default)]
pub struct EngineLog {
    inner: Mutex<LogInner>,
}

#[derive(Debug, Default)]
struct LogInner {
    boots: u32,
    evals: Vec<String>,
    installs: Vec<String>,
    runs: Vec<ShellCall>,
}

/// One recorded shell invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCall {
    /// Command line passed to the engine.
    pub command: String,
    /// Working directory the controller selected.
    pub cwd: String,
}

impl EngineLog {
    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// How many times the engine was booted.
    pub fn boots(&self) -> u32 {
        self.lock().boots
    }

    /// Code snippets evaluated, in order.
    pub fn evals(&self) -> Vec<String> {
        self.lock().evals.clone()
    }

    /// Packages actually fetched, in order.
    pub fn installs(&self) -> Vec<String> {
        self.lock().installs.clone()
    }

    /// Shell invocations, in order.
    pub fn runs(&self) -> Vec<ShellCall> {
        self.lock().runs.clone()
    }
}

/// One scripted Python evaluation.
#[derive(Debug, Clone)]
pub enum PyBehavior {
    /// Run to completion without ever polling the interruption flag,
    /// optionally burning `busy` of wall-clock time first.
    Complete {
        /// Simulated non-yielding compute time.
        busy: Duration,
        /// Outcome returned once the compute finishes.
        outcome: PythonOutcome,
    },
    /// Suspend repeatedly, polling the flag before each slice.
    SleepLoop {
        /// Length of one suspension.
        slice: Duration,
        /// Number of suspensions before completing.
        slices: u32,
        /// Outcome returned if never interrupted.
        outcome: PythonOutcome,
    },
    /// Engine-internal failure.
    Fail(String),
}

impl PyBehavior {
    /// Complete immediately with `outcome`.
    pub fn complete(outcome: PythonOutcome) -> Self {
        Self::Complete {
            busy: Duration::ZERO,
            outcome,
        }
    }

    /// Complete after `busy` of non-yielding compute.
    pub fn busy_complete(busy: Duration, outcome: PythonOutcome) -> Self {
        Self::Complete { busy, outcome }
    }

    /// Sleep `slices` times for `slice` each, polling between sleeps.
    pub fn sleep_loop(slice: Duration, slices: u32, outcome: PythonOutcome) -> Self {
        Self::SleepLoop {
            slice,
            slices,
            outcome,
        }
    }
}

/// Scripted Python engine.
///
/// Evaluations pop behaviors front-to-back; once the queue is empty every
/// evaluation completes immediately with an empty outcome, so trivial
/// follow-up calls in a test need no extra setup.
#[derive(Debug)]
pub struct ScriptedPython {
    plan: VecDeque<PyBehavior>,
    failing_packages: HashSet<String>,
    boot_failure: Option<String>,
    log: Arc<EngineLog>,
}

impl ScriptedPython {
    /// An engine with an empty plan (all evaluations succeed, empty output).
    pub fn new() -> Self {
        Self {
            plan: VecDeque::new(),
            failing_packages: HashSet::new(),
            boot_failure: None,
            log: Arc::new(EngineLog::default()),
        }
    }

    /// Handle to the observation log; clone it out before handing the
    /// engine to a sandbox builder.
    pub fn log(&self) -> Arc<EngineLog> {
        Arc::clone(&self.log)
    }

    /// Enqueue the behavior for the next unscripted evaluation.
    pub fn enqueue(mut self, behavior: PyBehavior) -> Self {
        self.plan.push_back(behavior);
        self
    }

    /// Make installs of `package` fail.
    pub fn fail_package(mut self, package: impl Into<String>) -> Self {
        self.failing_packages.insert(package.into());
        self
    }

    /// Make boot fail with `message`.
    pub fn fail_boot(mut self, message: impl Into<String>) -> Self {
        self.boot_failure = Some(message.into());
        self
    }
}

impl Default for ScriptedPython {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PythonEngine for ScriptedPython {
    async fn boot(
        &mut self,
        _workspace: Arc<Workspace>,
        _limits: &ResourceLimits,
    ) -> Result<(), EngineError> {
        self.log.lock().boots += 1;
        match &self.boot_failure {
            Some(message) => Err(EngineError::Boot(message.clone())),
            None => Ok(()),
        }
    }

    async fn eval(
        &mut self,
        code: &str,
        interrupt: InterruptHandle,
    ) -> Result<PythonOutcome, EngineError> {
        self.log.lock().evals.push(code.to_string());
        let behavior = self
            .plan
            .pop_front()
            .unwrap_or_else(|| PyBehavior::complete(PythonOutcome::default()));

        match behavior {
            PyBehavior::Complete { busy, outcome } => {
                // Non-yielding compute: the flag is deliberately never
                // polled, so a trip during `busy` changes nothing.
                if !busy.is_zero() {
                    tokio::time::sleep(busy).await;
                }
                Ok(outcome)
            }
            PyBehavior::SleepLoop {
                slice,
                slices,
                outcome,
            } => {
                for _ in 0..slices {
                    if interrupt.is_tripped() {
                        return Err(EngineError::Interrupted);
                    }
                    tokio::time::sleep(slice).await;
                }
                Ok(outcome)
            }
            PyBehavior::Fail(message) => Err(EngineError::Internal(message)),
        }
    }

    async fn install(&mut self, package: &str) -> Result<(), EngineError> {
        self.log.lock().installs.push(package.to_string());
        if self.failing_packages.contains(package) {
            return Err(EngineError::Install(format!("no matching distribution for {package}")));
        }
        Ok(())
    }
}

/// One scripted shell invocation.
#[derive(Debug, Clone)]
pub enum ShBehavior {
    /// Finish immediately with the outcome, ticking one command.
    Complete(ShellOutcome),
    /// Tick the command counter `commands` times, then finish.
    Commands {
        /// Commands the script "executes".
        commands: u64,
        /// Outcome returned if no cap trips.
        outcome: ShellOutcome,
    },
    /// Tick loop and command counters per iteration, then finish.
    Loop {
        /// Loop-body iterations (use [`ShBehavior::unbounded_loop`] for a
        /// loop that only a cap can stop).
        iterations: u64,
        /// Commands executed inside each iteration.
        commands_per_iteration: u64,
        /// Outcome returned if no cap trips.
        outcome: ShellOutcome,
    },
    /// Engine-internal failure.
    Fail(String),
}

impl ShBehavior {
    /// A `while true; do ...; done` stand-in: loops until a cap trips.
    pub fn unbounded_loop() -> Self {
        Self::Loop {
            iterations: u64::MAX,
            commands_per_iteration: 1,
            outcome: ShellOutcome::default(),
        }
    }
}

/// Scripted shell engine.
///
/// Like [`ScriptedPython`], invocations pop behaviors front-to-back and an
/// empty queue means immediate zero-exit success.
#[derive(Debug)]
pub struct ScriptedShell {
    plan: VecDeque<ShBehavior>,
    boot_failure: Option<String>,
    log: Arc<EngineLog>,
}

impl ScriptedShell {
    /// An engine with an empty plan (all commands exit 0, empty output).
    pub fn new() -> Self {
        Self {
            plan: VecDeque::new(),
            boot_failure: None,
            log: Arc::new(EngineLog::default()),
        }
    }

    /// Handle to the observation log.
    pub fn log(&self) -> Arc<EngineLog> {
        Arc::clone(&self.log)
    }

    /// Enqueue the behavior for the next unscripted invocation.
    pub fn enqueue(mut self, behavior: ShBehavior) -> Self {
        self.plan.push_back(behavior);
        self
    }

    /// Make boot fail with `message`.
    pub fn fail_boot(mut self, message: impl Into<String>) -> Self {
        self.boot_failure = Some(message.into());
        self
    }
}

impl Default for ScriptedShell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellEngine for ScriptedShell {
    async fn boot(
        &mut self,
        _workspace: Arc<Workspace>,
        _limits: &ResourceLimits,
    ) -> Result<(), EngineError> {
        self.log.lock().boots += 1;
        match &self.boot_failure {
            Some(message) => Err(EngineError::Boot(message.clone())),
            None => Ok(()),
        }
    }

    async fn run(
        &mut self,
        command: &str,
        cwd: &str,
        guard: &ExecGuard,
    ) -> Result<ShellOutcome, EngineError> {
        self.log.lock().runs.push(ShellCall {
            command: command.to_string(),
            cwd: cwd.to_string(),
        });
        let behavior = self
            .plan
            .pop_front()
            .unwrap_or_else(|| ShBehavior::Complete(ShellOutcome::default()));

        match behavior {
            ShBehavior::Complete(outcome) => {
                guard.tick_command()?;
                Ok(outcome)
            }
            ShBehavior::Commands { commands, outcome } => {
                for _ in 0..commands {
                    guard.tick_command()?;
                }
                Ok(outcome)
            }
            ShBehavior::Loop {
                iterations,
                commands_per_iteration,
                outcome,
            } => {
                for _ in 0..iterations {
                    guard.tick_loop()?;
                    for _ in 0..commands_per_iteration {
                        guard.tick_command()?;
                    }
                }
                Ok(outcome)
            }
            ShBehavior::Fail(message) => Err(EngineError::Internal(message)),
        }
    }
}
