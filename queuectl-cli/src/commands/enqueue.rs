//! Enqueue command handler.

use queuectl::prelude::*;

/// Join the raw command words and submit them as a new job.
pub async fn handle(
    store: &JobStore,
    command_parts: &[String],
    max_retries: u32,
) -> anyhow::Result<()> {
    let command = command_parts.join(" ");

    let job = store.insert(&command, max_retries).await?;

    println!("Enqueued job {}", job.id);
    println!("  command:     {}", job.command);
    println!("  max retries: {}", job.max_retries);
    Ok(())
}
