//! Linking a custom Python engine.
//!
//! The sandbox embeds no interpreter of its own; embedders implement the
//! engine traits against their runtime of choice and link them at build
//! time. This example links a toy engine that "evaluates" by echoing, to
//! show the seam and the structured results that come back.
//!
//! Run with: cargo run -p tidepool --example custom_engine

use std::sync::Arc;

use async_trait::async_trait;
use tidepool::engine::{EngineError, InterruptHandle, PythonEngine, PythonOutcome};
use tidepool::{ResourceLimits, Sandbox, Workspace};

struct EchoPython;

#[async_trait]
impl PythonEngine for EchoPython {
    async fn boot(
        &mut self,
        workspace: Arc<Workspace>,
        _limits: &ResourceLimits,
    ) -> Result<(), EngineError> {
        println!("booting against {}", workspace.virtual_root());
        Ok(())
    }

    async fn eval(
        &mut self,
        code: &str,
        _interrupt: InterruptHandle,
    ) -> Result<PythonOutcome, EngineError> {
        Ok(PythonOutcome {
            stdout: format!("would run: {code}\n"),
            ..Default::default()
        })
    }

    async fn install(&mut self, package: &str) -> Result<(), EngineError> {
        println!("would install: {package}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sandbox = Sandbox::builder()
        .workspace_root("./workspace-demo")
        .python_engine(EchoPython)
        .build()
        .await?;

    // Imports drive installs before the engine sees the code.
    let result = sandbox
        .execute_python("import numpy as np\nprint(np.zeros(3))", &[])
        .await;

    println!("success: {}", result.success);
    print!("stdout: {}", result.stdout);

    Ok(())
}
