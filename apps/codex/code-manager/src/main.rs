//! Code Manager Service - Entry Point
//!
//! Dispatches code execution jobs and collects their results.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    code_manager::run().await
}
