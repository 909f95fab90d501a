//! Python execution controller
//!
//! Owns the one long-lived Python engine session: lazily boots it on first
//! use, resolves and installs packages before each run, arms the wall-clock
//! interruption timer, and shapes raw engine outcomes into structured
//! results. Calls are served strictly in arrival order; the embedded runtime
//! is not reentrant, so a second call queues behind the one in flight.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::engine::{EngineError, InterruptHandle, PythonEngine, PythonOutcome};
use crate::error::SandboxError;
use crate::imports;
use crate::limits::{ResourceLimits, cap_output};
use crate::sandbox::{ExecutionResult, PackageInstallOutcome};

/// Controller for the Python half of the sandbox.
pub struct PythonController {
    session: tokio::sync::Mutex<PySession>,
    limits: Arc<ResourceLimits>,
    workspace: Arc<crate::workspace::Workspace>,
}

/// Session state guarded by the controller mutex.
///
/// `booted` is the session lifecycle in one bit: false is uninitialized,
/// true is ready. Initializing and executing both happen while the mutex is
/// held, which is what serializes queued callers.
struct PySession {
    engine: Box<dyn PythonEngine>,
    booted: bool,
    installed: HashSet<String>,
}

impl std::fmt::Debug for PythonController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PythonController")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl PythonController {
    pub(crate) fn new(
        engine: Box<dyn PythonEngine>,
        workspace: Arc<crate::workspace::Workspace>,
        limits: Arc<ResourceLimits>,
    ) -> Self {
        Self {
            session: tokio::sync::Mutex::new(PySession {
                engine,
                booted: false,
                installed: HashSet::new(),
            }),
            limits,
            workspace,
        }
    }

    /// Execute one Python snippet.
    ///
    /// Missing packages (scanned imports unioned with `explicit_packages`)
    /// are installed first over the privileged fetch channel; install
    /// failures are logged and reported per package but do not abort the
    /// run, since the interpreter raises its own error if the module is
    /// genuinely needed.
    ///
    /// The wall-clock timeout is cooperative: a timer trips a flag the
    /// runtime polls at safe points, so code that never yields (a tight
    /// CPU-bound loop) runs to completion regardless of the configured
    /// timeout. Only yielding code is reliably interruptible mid-flight.
    pub async fn execute(&self, code: &str, explicit_packages: &[String]) -> ExecutionResult {
        debug!(code_len = code.len(), "python execute requested");
        let mut session = self.session.lock().await;

        if let Err(err) = self.ensure_booted(&mut session).await {
            return ExecutionResult::from_error(&err);
        }

        for outcome in self.preinstall(&mut session, code, explicit_packages).await {
            if !outcome.success {
                warn!(
                    package = %outcome.package,
                    error = outcome.error.as_deref().unwrap_or(""),
                    "package install failed; continuing"
                );
            }
        }

        let interrupt = InterruptHandle::new();
        let timer = interrupt.arm(self.limits.timeout);
        let outcome = session.engine.eval(code, interrupt).await;
        timer.abort();

        match outcome {
            // A completed outcome is final even if the flag tripped after
            // the runtime's last poll point.
            Ok(outcome) => self.shape(outcome),
            Err(EngineError::Interrupted) => ExecutionResult::from_error(
                &SandboxError::ExecutionTimeout {
                    timeout_ms: self.limits.timeout_ms(),
                },
            ),
            Err(err) => ExecutionResult::from_error(&SandboxError::Interpreter(err.to_string())),
        }
    }

    /// Install packages by name, idempotently per session.
    pub async fn install_packages(&self, packages: &[String]) -> Vec<PackageInstallOutcome> {
        let mut session = self.session.lock().await;

        if let Err(err) = self.ensure_booted(&mut session).await {
            let message = err.to_string();
            return packages
                .iter()
                .map(|package| PackageInstallOutcome {
                    package: package.clone(),
                    success: false,
                    error: Some(message.clone()),
                })
                .collect();
        }

        let mut outcomes = Vec::with_capacity(packages.len());
        for package in packages {
            outcomes.push(Self::install_one(&mut session, package).await);
        }
        outcomes
    }

    /// Boot the engine if this is the first use of the session.
    ///
    /// A failed boot leaves the session uninitialized so a later call can
    /// retry; the failure itself is reported, not fatal.
    async fn ensure_booted(&self, session: &mut PySession) -> Result<(), SandboxError> {
        if session.booted {
            return Ok(());
        }
        info!("booting python runtime");
        session
            .engine
            .boot(Arc::clone(&self.workspace), &self.limits)
            .await
            .map_err(|err| SandboxError::EngineUnavailable(err.to_string()))?;
        session.booted = true;
        Ok(())
    }

    /// Install whatever the snippet needs that the session does not have.
    async fn preinstall(
        &self,
        session: &mut PySession,
        code: &str,
        explicit_packages: &[String],
    ) -> Vec<PackageInstallOutcome> {
        let mut wanted = imports::resolve_packages(code);
        for package in explicit_packages {
            if !wanted.contains(package) {
                wanted.push(package.clone());
            }
        }

        let mut outcomes = Vec::new();
        for package in wanted {
            if session.installed.contains(&package) {
                continue;
            }
            outcomes.push(Self::install_one(session, &package).await);
        }
        outcomes
    }

    /// Install a single package, skipping the fetch when the session
    /// already has it.
    async fn install_one(session: &mut PySession, package: &str) -> PackageInstallOutcome {
        if session.installed.contains(package) {
            return PackageInstallOutcome {
                package: package.to_string(),
                success: true,
                error: None,
            };
        }
        match session.engine.install(package).await {
            Ok(()) => {
                session.installed.insert(package.to_string());
                PackageInstallOutcome {
                    package: package.to_string(),
                    success: true,
                    error: None,
                }
            }
            Err(err) => {
                let message = match err {
                    EngineError::Install(message) => message,
                    other => other.to_string(),
                };
                let err = SandboxError::PackageInstall {
                    package: package.to_string(),
                    message,
                };
                PackageInstallOutcome {
                    package: package.to_string(),
                    success: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Fold a raw engine outcome into the caller-facing result shape.
    fn shape(&self, outcome: PythonOutcome) -> ExecutionResult {
        let error = outcome.fault.as_ref().map(crate::engine::PythonFault::render);
        ExecutionResult {
            success: outcome.fault.is_none(),
            stdout: cap_output(&outcome.stdout, &self.limits),
            stderr: cap_output(&outcome.stderr, &self.limits),
            result: outcome.value,
            error,
            exit_code: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::PythonFault;
    use crate::engine::scripted::{PyBehavior, ScriptedPython};
    use crate::workspace::Workspace;

    async fn controller(engine: ScriptedPython) -> (tempfile::TempDir, PythonController) {
        controller_with_limits(engine, ResourceLimits::default()).await
    }

    async fn controller_with_limits(
        engine: ScriptedPython,
        limits: ResourceLimits,
    ) -> (tempfile::TempDir, PythonController) {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Arc::new(Workspace::create(dir.path().join("ws")).await.unwrap());
        let controller = PythonController::new(Box::new(engine), workspace, Arc::new(limits));
        (dir, controller)
    }

    // ==================== Session Lifecycle Tests ====================

    #[tokio::test]
    async fn test_boot_is_lazy_and_once() {
        let engine = ScriptedPython::new();
        let log = engine.log();
        let (_dir, controller) = controller(engine).await;

        assert_eq!(log.boots(), 0);
        controller.execute("x = 1", &[]).await;
        assert_eq!(log.boots(), 1);
        controller.execute("x = 2", &[]).await;
        assert_eq!(log.boots(), 1);
    }

    #[tokio::test]
    async fn test_boot_failure_is_reported_and_retried() {
        let engine = ScriptedPython::new().fail_boot("runtime image missing");
        let log = engine.log();
        let (_dir, controller) = controller(engine).await;

        let result = controller.execute("x = 1", &[]).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("runtime image missing"));

        // Session stayed uninitialized, so the next call boots again.
        let result = controller.execute("x = 1", &[]).await;
        assert!(!result.success);
        assert_eq!(log.boots(), 2);
    }

    #[tokio::test]
    async fn test_calls_are_served_in_arrival_order() {
        let engine = ScriptedPython::new()
            .enqueue(PyBehavior::sleep_loop(
                Duration::from_millis(5),
                2,
                PythonOutcome::default(),
            ))
            .enqueue(PyBehavior::complete(PythonOutcome::default()));
        let log = engine.log();
        let (_dir, controller) = controller(engine).await;

        // join! polls left to right on the current-thread runtime, so the
        // first future takes the session lock and the second queues.
        let (first, second) = tokio::join!(
            controller.execute("first", &[]),
            controller.execute("second", &[]),
        );

        assert!(first.success);
        assert!(second.success);
        assert_eq!(log.evals(), vec!["first", "second"]);
    }

    // ==================== Package Resolution Tests ====================

    #[tokio::test]
    async fn test_imports_drive_installation() {
        let engine = ScriptedPython::new();
        let log = engine.log();
        let (_dir, controller) = controller(engine).await;

        controller
            .execute("import os\nimport numpy\nfrom PIL import Image", &[])
            .await;

        // stdlib filtered, alias applied
        assert_eq!(log.installs(), vec!["numpy", "pillow"]);
    }

    #[tokio::test]
    async fn test_explicit_packages_are_unioned() {
        let engine = ScriptedPython::new();
        let log = engine.log();
        let (_dir, controller) = controller(engine).await;

        controller
            .execute("import numpy", &["numpy".to_string(), "requests".to_string()])
            .await;

        assert_eq!(log.installs(), vec!["numpy", "requests"]);
    }

    #[tokio::test]
    async fn test_installed_packages_are_not_refetched() {
        let engine = ScriptedPython::new();
        let log = engine.log();
        let (_dir, controller) = controller(engine).await;

        controller.execute("import numpy", &[]).await;
        controller.execute("import numpy\nprint(1)", &[]).await;

        assert_eq!(log.installs(), vec!["numpy"]);
    }

    #[tokio::test]
    async fn test_install_packages_idempotent() {
        let engine = ScriptedPython::new();
        let log = engine.log();
        let (_dir, controller) = controller(engine).await;

        let first = controller.install_packages(&["numpy".to_string()]).await;
        let second = controller.install_packages(&["numpy".to_string()]).await;

        assert!(first[0].success);
        assert!(second[0].success);
        // Second install reports success without re-fetching.
        assert_eq!(log.installs(), vec!["numpy"]);
    }

    #[tokio::test]
    async fn test_install_failure_is_per_package() {
        let engine = ScriptedPython::new().fail_package("leftpad");
        let (_dir, controller) = controller(engine).await;

        let outcomes = controller
            .install_packages(&["numpy".to_string(), "leftpad".to_string(), "requests".to_string()])
            .await;

        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert!(
            outcomes[1]
                .error
                .as_deref()
                .unwrap()
                .starts_with("failed to install leftpad")
        );
        // A failing sibling does not abort later installs.
        assert!(outcomes[2].success);
    }

    #[tokio::test]
    async fn test_install_failure_does_not_abort_execution() {
        let engine = ScriptedPython::new()
            .fail_package("leftpad")
            .enqueue(PyBehavior::complete(PythonOutcome {
                stdout: "ran anyway\n".to_string(),
                ..Default::default()
            }));
        let (_dir, controller) = controller(engine).await;

        let result = controller.execute("import leftpad", &[]).await;

        assert!(result.success);
        assert_eq!(result.stdout, "ran anyway\n");
    }

    #[tokio::test]
    async fn test_install_packages_with_unbootable_engine() {
        let engine = ScriptedPython::new().fail_boot("no runtime");
        let (_dir, controller) = controller(engine).await;

        let outcomes = controller.install_packages(&["numpy".to_string()]).await;
        assert!(!outcomes[0].success);
        assert!(outcomes[0].error.as_deref().unwrap().contains("no runtime"));
    }

    // ==================== Timeout Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_yielding_code_times_out_with_configured_value() {
        let engine = ScriptedPython::new().enqueue(PyBehavior::sleep_loop(
            Duration::from_millis(10),
            1000,
            PythonOutcome::default(),
        ));
        let limits = ResourceLimits {
            timeout: Duration::from_millis(45),
            ..Default::default()
        };
        let (_dir, controller) = controller_with_limits(engine, limits).await;

        let result = controller.execute("while True: time.sleep(0.01)", &[]).await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("45ms"));
        assert!(result.result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_yielding_code_is_never_timed_out() {
        let engine = ScriptedPython::new().enqueue(PyBehavior::busy_complete(
            Duration::from_millis(200),
            PythonOutcome {
                value: Some("499500".to_string()),
                ..Default::default()
            },
        ));
        let limits = ResourceLimits {
            timeout: Duration::from_millis(5),
            ..Default::default()
        };
        let (_dir, controller) = controller_with_limits(engine, limits).await;

        let result = controller.execute("sum(range(1000))", &[]).await;

        // The flag tripped long before completion, but the runtime never
        // polled it; the completed outcome stands.
        assert!(result.success);
        assert_eq!(result.result.as_deref(), Some("499500"));
        assert!(result.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_yielding_code_does_not_time_out() {
        let engine = ScriptedPython::new().enqueue(PyBehavior::sleep_loop(
            Duration::from_millis(5),
            3,
            PythonOutcome {
                stdout: "done\n".to_string(),
                ..Default::default()
            },
        ));
        let limits = ResourceLimits {
            timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let (_dir, controller) = controller_with_limits(engine, limits).await;

        let result = controller.execute("time.sleep(0.015)", &[]).await;

        assert!(result.success);
        assert_eq!(result.stdout, "done\n");
    }

    // ==================== Result Shaping Tests ====================

    #[tokio::test]
    async fn test_expression_value_is_carried() {
        let engine = ScriptedPython::new().enqueue(PyBehavior::complete(PythonOutcome {
            stdout: "computing\n".to_string(),
            value: Some("42".to_string()),
            ..Default::default()
        }));
        let (_dir, controller) = controller(engine).await;

        let result = controller.execute("40 + 2", &[]).await;

        assert!(result.success);
        assert_eq!(result.result.as_deref(), Some("42"));
        assert_eq!(result.stdout, "computing\n");
        assert!(result.exit_code.is_none());
    }

    #[tokio::test]
    async fn test_statement_has_no_result_value() {
        let engine = ScriptedPython::new().enqueue(PyBehavior::complete(PythonOutcome {
            stdout: "hi\n".to_string(),
            ..Default::default()
        }));
        let (_dir, controller) = controller(engine).await;

        let result = controller.execute("print('hi')", &[]).await;

        assert!(result.success);
        assert!(result.result.is_none());
    }

    #[tokio::test]
    async fn test_uncaught_exception_is_shaped_not_propagated() {
        let engine = ScriptedPython::new().enqueue(PyBehavior::complete(PythonOutcome {
            stdout: "before the crash\n".to_string(),
            fault: Some(PythonFault {
                kind: "ZeroDivisionError".to_string(),
                message: "division by zero".to_string(),
            }),
            ..Default::default()
        }));
        let (_dir, controller) = controller(engine).await;

        let result = controller.execute("1 / 0", &[]).await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("ZeroDivisionError: division by zero"));
        assert_eq!(result.stdout, "before the crash\n");
    }

    #[tokio::test]
    async fn test_engine_fault_is_shaped_not_propagated() {
        let engine = ScriptedPython::new()
            .enqueue(PyBehavior::Fail("runtime trap: unreachable".to_string()));
        let (_dir, controller) = controller(engine).await;

        let result = controller.execute("anything", &[]).await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("runtime trap"));
    }

    #[tokio::test]
    async fn test_stdout_is_capped() {
        let engine = ScriptedPython::new().enqueue(PyBehavior::complete(PythonOutcome {
            stdout: "x".repeat(64),
            ..Default::default()
        }));
        let limits = ResourceLimits {
            max_output_bytes: 16,
            ..Default::default()
        };
        let (_dir, controller) = controller_with_limits(engine, limits).await;

        let result = controller.execute("print('x' * 64)", &[]).await;

        assert!(result.stdout.contains("truncated"));
        assert!(result.stdout.len() < 64 + 32);
    }
}
