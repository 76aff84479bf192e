//! Retry Worker - Entry Point
//!
//! Drains the retry store back onto the original topics.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    retry_worker::run().await
}
