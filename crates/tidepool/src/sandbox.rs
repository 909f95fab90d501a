//! Sandbox coordinator
//!
//! The composition root: owns the workspace and both interpreter sessions
//! for the process lifetime, routes execution requests to the matching
//! controller by language tag, and exposes read-only workspace
//! introspection that does not go through an execution request.
//!
//! # Example
//!
//! ```rust,ignore
//! use tidepool::{ResourceLimits, Sandbox};
//!
//! let sandbox = Sandbox::builder()
//!     .workspace_root("/var/lib/agent/workspace")
//!     .limits(ResourceLimits::default())
//!     .python_engine(my_python_runtime)
//!     .shell_engine(my_shell_emulator)
//!     .build()
//!     .await?;
//!
//! sandbox.write_file("data.csv", "a,b\n1,2\n").await?;
//! let result = sandbox.execute_python("import csv\nprint(1)", &[]).await;
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::SandboxConfig;
use crate::engine::{PythonEngine, ShellEngine, UnconfiguredPython, UnconfiguredShell};
use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::python::PythonController;
use crate::shell::ShellController;
use crate::workspace::{FileEntry, Workspace};

/// Language tag of an execution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Route to the Python controller.
    Python,
    /// Route to the shell controller.
    Shell,
}

/// Per-call options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecOptions {
    /// Packages to install before a Python run, unioned with the scanned
    /// imports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    /// Working-directory override for a shell run, scoped to this call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// One submitted snippet. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Source text to execute.
    pub code: String,
    /// Which interpreter runs it.
    pub language: Language,
    /// Per-call options.
    #[serde(default)]
    pub options: ExecOptions,
}

/// Structured outcome of one execution request.
///
/// Produced exactly once per request. Fields that could not be computed are
/// absent, never stale: a Python result carries no `exit_code`, a shell
/// result no `result` value, and a failed run reports what it has plus a
/// human-readable `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the run completed without fault, timeout, or cap trip.
    pub success: bool,
    /// Captured stdout, capped at the configured output limit.
    pub stdout: String,
    /// Captured stderr, capped at the configured output limit.
    pub stderr: String,
    /// Repr of the last evaluated Python expression, when there was one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Human-readable failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Exit code of a shell pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ExecutionResult {
    /// A failed result carrying only the error message.
    pub(crate) fn from_error(err: &SandboxError) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            result: None,
            error: Some(err.to_string()),
            exit_code: None,
        }
    }
}

/// Install outcome for one requested or auto-detected package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInstallOutcome {
    /// Package name as requested.
    pub package: String,
    /// Whether the package is now available in the session.
    pub success: bool,
    /// Installer message when the install failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sandboxed execution coordinator.
///
/// One instance owns one workspace and one session per language. Sessions
/// initialize lazily on first use and persist until the sandbox is dropped;
/// calls into the same controller are served strictly in arrival order.
pub struct Sandbox {
    workspace: Arc<Workspace>,
    limits: Arc<ResourceLimits>,
    python: PythonController,
    shell: ShellController,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("workspace", &self.workspace)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Start building a sandbox.
    pub fn builder() -> SandboxBuilder {
        SandboxBuilder::new()
    }

    /// Route a request to the matching controller.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        match request.language {
            Language::Python => {
                self.python
                    .execute(&request.code, &request.options.packages)
                    .await
            }
            Language::Shell => {
                self.shell
                    .execute(&request.code, request.options.cwd.as_deref())
                    .await
            }
        }
    }

    /// Execute Python code with optional explicit packages.
    pub async fn execute_python(&self, code: &str, packages: &[String]) -> ExecutionResult {
        self.python.execute(code, packages).await
    }

    /// Install packages into the Python session.
    pub async fn install_packages(&self, packages: &[String]) -> Vec<PackageInstallOutcome> {
        self.python.install_packages(packages).await
    }

    /// Execute a shell command, optionally in a workspace subdirectory.
    pub async fn execute_shell(&self, command: &str, cwd: Option<&str>) -> ExecutionResult {
        self.shell.execute(command, cwd).await
    }

    /// Write text to a workspace file, creating parent directories.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        Ok(self.workspace.write(path, content).await?)
    }

    /// Read a workspace file as text.
    pub async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        Ok(self.workspace.read(path).await?)
    }

    /// List a workspace directory (the root when `path` is `None`).
    pub async fn list_files(&self, path: Option<&str>) -> Result<Vec<FileEntry>, SandboxError> {
        Ok(self.workspace.list(path).await?)
    }

    /// Delete a workspace file, symlink, or empty directory.
    pub async fn delete_file(&self, path: &str) -> Result<(), SandboxError> {
        Ok(self.workspace.delete(path).await?)
    }

    /// The workspace bridge shared by both sessions.
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// The limits both controllers enforce.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }
}

/// Builder for [`Sandbox`].
pub struct SandboxBuilder {
    workspace_root: Option<PathBuf>,
    virtual_root: Option<String>,
    limits: ResourceLimits,
    python_engine: Option<Box<dyn PythonEngine>>,
    shell_engine: Option<Box<dyn ShellEngine>>,
}

impl std::fmt::Debug for SandboxBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxBuilder")
            .field("workspace_root", &self.workspace_root)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl SandboxBuilder {
    /// A builder with default limits, a `./workspace` root, and no engines.
    pub fn new() -> Self {
        Self {
            workspace_root: None,
            virtual_root: None,
            limits: ResourceLimits::default(),
            python_engine: None,
            shell_engine: None,
        }
    }

    /// Host directory backing the workspace (created if missing).
    pub fn workspace_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(path.into());
        self
    }

    /// Virtual root path sandboxed code sees (default `/workspace`).
    pub fn virtual_root(mut self, root: impl Into<String>) -> Self {
        self.virtual_root = Some(root.into());
        self
    }

    /// Resource limits shared by both controllers.
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Apply a loaded configuration (workspace root and limits).
    pub fn config(mut self, config: SandboxConfig) -> Self {
        self.workspace_root = Some(config.workspace_root);
        self.limits = config.limits;
        self
    }

    /// Link the embedded Python runtime.
    ///
    /// Without one, Python executions report a structured
    /// engine-unavailable failure per call.
    pub fn python_engine(mut self, engine: impl PythonEngine + 'static) -> Self {
        self.python_engine = Some(Box::new(engine));
        self
    }

    /// Link the embedded shell emulator.
    pub fn shell_engine(mut self, engine: impl ShellEngine + 'static) -> Self {
        self.shell_engine = Some(Box::new(engine));
        self
    }

    /// Validate limits, open the workspace, and assemble the coordinator.
    pub async fn build(self) -> Result<Sandbox, SandboxError> {
        self.limits.validate()?;

        let root = self
            .workspace_root
            .unwrap_or_else(|| PathBuf::from("workspace"));
        let workspace = match &self.virtual_root {
            Some(virtual_root) => {
                Workspace::create_with_virtual_root(root, virtual_root).await?
            }
            None => Workspace::create(root).await?,
        };
        let workspace = Arc::new(workspace);
        let limits = Arc::new(self.limits);

        let python_engine = self
            .python_engine
            .unwrap_or_else(|| Box::new(UnconfiguredPython));
        let shell_engine = self
            .shell_engine
            .unwrap_or_else(|| Box::new(UnconfiguredShell));

        Ok(Sandbox {
            python: PythonController::new(
                python_engine,
                Arc::clone(&workspace),
                Arc::clone(&limits),
            ),
            shell: ShellController::new(
                shell_engine,
                Arc::clone(&workspace),
                Arc::clone(&limits),
            ),
            workspace,
            limits,
        })
    }
}

impl Default for SandboxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::ShellOutcome;
    use crate::engine::scripted::{PyBehavior, ScriptedPython, ScriptedShell, ShBehavior};
    use crate::workspace::FsError;

    async fn bare_sandbox() -> (tempfile::TempDir, Sandbox) {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::builder()
            .workspace_root(dir.path().join("ws"))
            .build()
            .await
            .unwrap();
        (dir, sandbox)
    }

    // ==================== Builder Tests ====================

    #[tokio::test]
    async fn test_build_rejects_invalid_limits() {
        let dir = tempfile::tempdir().unwrap();
        let err = Sandbox::builder()
            .workspace_root(dir.path().join("ws"))
            .limits(ResourceLimits {
                max_command_count: 0,
                ..Default::default()
            })
            .build()
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::InvalidLimit(_)));
    }

    #[tokio::test]
    async fn test_build_creates_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("fresh/ws");
        let sandbox = Sandbox::builder()
            .workspace_root(&root)
            .build()
            .await
            .unwrap();

        assert!(root.is_dir());
        assert_eq!(sandbox.workspace().virtual_root(), "/workspace");
    }

    #[tokio::test]
    async fn test_custom_virtual_root() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::builder()
            .workspace_root(dir.path().join("ws"))
            .virtual_root("/mnt/data")
            .build()
            .await
            .unwrap();

        assert_eq!(sandbox.workspace().virtual_root(), "/mnt/data");
    }

    // ==================== Routing Tests ====================

    #[tokio::test]
    async fn test_requests_route_by_language() {
        let dir = tempfile::tempdir().unwrap();
        let python = ScriptedPython::new().enqueue(PyBehavior::complete(Default::default()));
        let shell =
            ScriptedShell::new().enqueue(ShBehavior::Complete(ShellOutcome::success("ok\n")));
        let py_log = python.log();
        let sh_log = shell.log();

        let sandbox = Sandbox::builder()
            .workspace_root(dir.path().join("ws"))
            .python_engine(python)
            .shell_engine(shell)
            .build()
            .await
            .unwrap();

        sandbox
            .execute(ExecutionRequest {
                code: "print(1)".to_string(),
                language: Language::Python,
                options: ExecOptions::default(),
            })
            .await;
        let shell_result = sandbox
            .execute(ExecutionRequest {
                code: "echo ok".to_string(),
                language: Language::Shell,
                options: ExecOptions::default(),
            })
            .await;

        assert_eq!(py_log.evals(), vec!["print(1)"]);
        assert_eq!(sh_log.runs()[0].command, "echo ok");
        assert_eq!(shell_result.stdout, "ok\n");
    }

    #[tokio::test]
    async fn test_shell_request_carries_cwd_option() {
        let dir = tempfile::tempdir().unwrap();
        let shell = ScriptedShell::new();
        let log = shell.log();
        let sandbox = Sandbox::builder()
            .workspace_root(dir.path().join("ws"))
            .shell_engine(shell)
            .build()
            .await
            .unwrap();

        sandbox.write_file("proj/x.txt", "x").await.unwrap();
        sandbox
            .execute(ExecutionRequest {
                code: "ls".to_string(),
                language: Language::Shell,
                options: ExecOptions {
                    cwd: Some("proj".to_string()),
                    ..Default::default()
                },
            })
            .await;

        assert_eq!(log.runs()[0].cwd, "/workspace/proj");
    }

    // ==================== Engine-less Sandbox Tests ====================

    #[tokio::test]
    async fn test_executions_without_engines_fail_structurally() {
        let (_dir, sandbox) = bare_sandbox().await;

        let python = sandbox.execute_python("print(1)", &[]).await;
        assert!(!python.success);
        assert!(python.error.as_deref().unwrap().contains("no python engine configured"));

        let shell = sandbox.execute_shell("true", None).await;
        assert!(!shell.success);
        assert!(shell.stderr.contains("no shell engine configured"));
    }

    #[tokio::test]
    async fn test_file_operations_work_without_engines() {
        let (_dir, sandbox) = bare_sandbox().await;

        sandbox.write_file("a.txt", "alpha").await.unwrap();
        assert_eq!(sandbox.read_file("a.txt").await.unwrap(), "alpha");
        assert_eq!(sandbox.list_files(None).await.unwrap().len(), 1);
        sandbox.delete_file("a.txt").await.unwrap();
        assert!(sandbox.list_files(None).await.unwrap().is_empty());
    }

    // ==================== File Operation Error Mapping ====================

    #[tokio::test]
    async fn test_escape_surfaces_as_security_violation() {
        let (_dir, sandbox) = bare_sandbox().await;

        let err = sandbox.write_file("../break.txt", "x").await.unwrap_err();
        assert!(matches!(err, SandboxError::SecurityViolation(_)));

        let err = sandbox.read_file("../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, SandboxError::SecurityViolation(_)));
    }

    #[tokio::test]
    async fn test_plain_io_failures_stay_filesystem_errors() {
        let (_dir, sandbox) = bare_sandbox().await;

        let err = sandbox.read_file("missing.txt").await.unwrap_err();
        assert!(matches!(err, SandboxError::Filesystem(FsError::NotFound(_))));
    }

    // ==================== Wire Shape Tests ====================

    #[test]
    fn test_result_serialization_omits_absent_fields() {
        let result = ExecutionResult {
            success: true,
            stdout: "out".to_string(),
            stderr: String::new(),
            result: None,
            error: None,
            exit_code: None,
        };

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(!json.contains("\"result\""));
        assert!(!json.contains("\"error\""));
        assert!(!json.contains("\"exit_code\""));
    }

    #[test]
    fn test_request_deserialization_defaults_options() {
        let request: ExecutionRequest =
            serde_json::from_str(r#"{"code": "print(1)", "language": "python"}"#).unwrap();

        assert_eq!(request.language, Language::Python);
        assert!(request.options.packages.is_empty());
        assert!(request.options.cwd.is_none());
    }

    #[test]
    fn test_language_tags_are_lowercase() {
        assert_eq!(serde_json::to_string(&Language::Python).unwrap(), "\"python\"");
        assert_eq!(serde_json::to_string(&Language::Shell).unwrap(), "\"shell\"");
    }
}
