//! Workspace file API usage example.
//!
//! Demonstrates the host-side file operations every sandbox exposes even
//! before any interpreter engine is linked.
//!
//! Run with: cargo run -p tidepool --example workspace

use tidepool::Sandbox;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Back the workspace with a directory under the current one.
    let sandbox = Sandbox::builder()
        .workspace_root("./workspace-demo")
        .build()
        .await?;

    println!("=== Writing files ===");
    sandbox.write_file("notes/todo.md", "- ship it\n").await?;
    sandbox.write_file("data.csv", "a,b\n1,2\n").await?;

    println!("=== Listing the root ===");
    for entry in sandbox.list_files(None).await? {
        let kind = if entry.is_dir { "dir " } else { "file" };
        println!("{kind} {} ({} bytes)", entry.name, entry.size);
    }

    println!("\n=== Reading back (any path spelling) ===");
    print!("{}", sandbox.read_file("/workspace/data.csv").await?);
    print!("{}", sandbox.read_file("data.csv").await?);

    println!("\n=== Escapes are refused ===");
    match sandbox.write_file("../outside.txt", "x").await {
        Ok(()) => println!("unexpectedly allowed"),
        Err(err) => println!("refused: {err}"),
    }

    sandbox.delete_file("data.csv").await?;
    Ok(())
}
