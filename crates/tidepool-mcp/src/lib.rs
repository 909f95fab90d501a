//! Tidepool MCP Server
//!
//! An MCP server that exposes the Tidepool execution sandbox as a set of
//! tools: Python and shell execution inside persistent sessions, package
//! installs, and direct workspace file access.
//!
//! Execution failures (timeouts, tripped limits, refused paths, uncaught
//! exceptions) come back inside a normal tool result as a `success: false`
//! payload. Only malformed arguments or an unknown tool name surface as a
//! protocol-level error.

use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, ServerHandler,
    model::*,
    schemars::{self, JsonSchema},
    service::{RequestContext, RoleServer},
};
use serde::{Deserialize, Serialize};
use tidepool::{FileEntry, Sandbox, SandboxError};

/// Parameters for the `run_python` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunPythonParams {
    /// Python source to execute in the persistent session. Top-level
    /// imports of missing packages are installed automatically.
    pub code: String,

    /// Extra packages to install before running, for imports the scanner
    /// cannot see (plugins, lazy imports).
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Parameters for the `install_packages` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InstallPackagesParams {
    /// Package names to install into the Python session.
    pub packages: Vec<String>,
}

/// Parameters for the `run_shell` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunShellParams {
    /// Shell command line to interpret (pipes and redirects supported).
    pub command: String,

    /// Working directory for this call only, as a workspace path.
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Parameters for the `write_file` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WriteFileParams {
    /// Workspace path of the file (parent directories are created).
    pub path: String,

    /// Full text content to write.
    pub content: String,
}

/// Parameters for the `read_file` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReadFileParams {
    /// Workspace path of the file to read.
    pub path: String,
}

/// Parameters for the `list_files` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListFilesParams {
    /// Workspace directory to list; omit for the workspace root.
    #[serde(default)]
    pub path: Option<String>,
}

/// Parameters for the `delete_file` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeleteFileParams {
    /// Workspace path of the file, symlink, or empty directory to delete.
    pub path: String,
}

/// Result payload for the workspace file tools.
#[derive(Debug, Serialize)]
struct FileOpOutcome {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entries: Option<Vec<FileEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl FileOpOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            content: None,
            entries: None,
            error: None,
        }
    }

    fn with_content(content: String) -> Self {
        Self {
            content: Some(content),
            ..Self::ok()
        }
    }

    fn with_entries(entries: Vec<FileEntry>) -> Self {
        Self {
            entries: Some(entries),
            ..Self::ok()
        }
    }

    fn failed(err: &SandboxError) -> Self {
        Self {
            success: false,
            content: None,
            entries: None,
            error: Some(err.to_string()),
        }
    }
}

/// MCP server that fronts one [`Sandbox`] over stdio.
#[derive(Clone)]
pub struct SandboxServer {
    sandbox: Arc<Sandbox>,
}

impl std::fmt::Debug for SandboxServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxServer").finish_non_exhaustive()
    }
}

impl SandboxServer {
    /// Wrap a built sandbox. Sessions live as long as the server.
    pub fn new(sandbox: Sandbox) -> Self {
        Self {
            sandbox: Arc::new(sandbox),
        }
    }
}

/// Serialize a payload into the text content of a successful tool result.
fn json_result<T: Serialize>(payload: &T) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(payload).map_err(|e| {
        McpError::internal_error(format!("Failed to serialize result: {}", e), None)
    })?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

/// Deserialize tool arguments, treating absent arguments as `{}`.
fn parse_params<P: serde::de::DeserializeOwned>(
    request: &CallToolRequestParam,
) -> Result<P, McpError> {
    let args = request.arguments.clone().unwrap_or_default();
    serde_json::from_value(serde_json::Value::Object(args))
        .map_err(|e| McpError::invalid_params(format!("Invalid parameters: {}", e), None))
}

/// Build a tool definition from a parameter type's derived schema.
fn tool<P: JsonSchema>(name: &'static str, title: &'static str, description: &'static str) -> Tool {
    let schema = schemars::schema_for!(P);
    let schema_json = serde_json::to_value(schema).unwrap_or_default();
    let input_schema = match schema_json {
        serde_json::Value::Object(map) => Arc::new(map),
        _ => Arc::new(serde_json::Map::new()),
    };

    Tool {
        name: name.into(),
        title: Some(title.into()),
        description: Some(description.into()),
        input_schema,
        output_schema: None,
        annotations: None,
        icons: None,
        meta: None,
    }
}

impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Tidepool provides an isolated workspace with persistent Python and shell \
                sessions. Use 'run_python' for computation (variables and installed packages \
                persist between calls), 'run_shell' for file inspection and pipelines, and the \
                file tools to move data in and out of the workspace. All paths are confined to \
                the workspace; execution is bounded by wall-clock and resource limits."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: vec![
                tool::<RunPythonParams>(
                    "run_python",
                    "Run Python Code",
                    "Execute Python code in a persistent sandboxed session. Variables, \
                    definitions, and installed packages survive across calls. Missing imports \
                    are installed automatically; the result reports stdout, stderr, the value \
                    of the last expression, and any uncaught exception.",
                ),
                tool::<InstallPackagesParams>(
                    "install_packages",
                    "Install Python Packages",
                    "Install packages into the Python session ahead of time. Already-installed \
                    packages succeed without refetching; each package reports its own outcome.",
                ),
                tool::<RunShellParams>(
                    "run_shell",
                    "Run Shell Command",
                    "Interpret a shell command line against the workspace. Supports pipes and \
                    redirects; loop-iteration and command-count caps stop runaway scripts. The \
                    result carries stdout, stderr, and the exit code.",
                ),
                tool::<WriteFileParams>(
                    "write_file",
                    "Write Workspace File",
                    "Write text to a workspace file, creating parent directories as needed. \
                    Paths outside the workspace are refused.",
                ),
                tool::<ReadFileParams>(
                    "read_file",
                    "Read Workspace File",
                    "Read a workspace file as text.",
                ),
                tool::<ListFilesParams>(
                    "list_files",
                    "List Workspace Files",
                    "List a workspace directory (the root when no path is given), sorted by \
                    name.",
                ),
                tool::<DeleteFileParams>(
                    "delete_file",
                    "Delete Workspace File",
                    "Delete a workspace file, symlink, or empty directory.",
                ),
            ],
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        match request.name.as_ref() {
            "run_python" => {
                let params: RunPythonParams = parse_params(&request)?;
                let result = self
                    .sandbox
                    .execute_python(&params.code, &params.packages)
                    .await;
                json_result(&result)
            }
            "install_packages" => {
                let params: InstallPackagesParams = parse_params(&request)?;
                let outcomes = self.sandbox.install_packages(&params.packages).await;
                json_result(&outcomes)
            }
            "run_shell" => {
                let params: RunShellParams = parse_params(&request)?;
                let result = self
                    .sandbox
                    .execute_shell(&params.command, params.cwd.as_deref())
                    .await;
                json_result(&result)
            }
            "write_file" => {
                let params: WriteFileParams = parse_params(&request)?;
                let payload = match self.sandbox.write_file(&params.path, &params.content).await {
                    Ok(()) => FileOpOutcome::ok(),
                    Err(err) => FileOpOutcome::failed(&err),
                };
                json_result(&payload)
            }
            "read_file" => {
                let params: ReadFileParams = parse_params(&request)?;
                let payload = match self.sandbox.read_file(&params.path).await {
                    Ok(content) => FileOpOutcome::with_content(content),
                    Err(err) => FileOpOutcome::failed(&err),
                };
                json_result(&payload)
            }
            "list_files" => {
                let params: ListFilesParams = parse_params(&request)?;
                let payload = match self.sandbox.list_files(params.path.as_deref()).await {
                    Ok(entries) => FileOpOutcome::with_entries(entries),
                    Err(err) => FileOpOutcome::failed(&err),
                };
                json_result(&payload)
            }
            "delete_file" => {
                let params: DeleteFileParams = parse_params(&request)?;
                let payload = match self.sandbox.delete_file(&params.path).await {
                    Ok(()) => FileOpOutcome::ok(),
                    Err(err) => FileOpOutcome::failed(&err),
                };
                json_result(&payload)
            }
            _ => Err(McpError::invalid_params(
                format!("Unknown tool: {}", request.name),
                None,
            )),
        }
    }
}
