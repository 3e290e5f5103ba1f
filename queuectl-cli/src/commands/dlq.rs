//! Dead-letter queue command handlers.

use std::io::{self, BufRead, Write};

use queuectl::prelude::*;

pub async fn handle_list(store: &JobStore, limit: u32, json: bool) -> anyhow::Result<()> {
    let entries = store.list_dlq(limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Dead-letter queue is empty.");
        return Ok(());
    }

    println!("Dead-letter queue (up to {limit} entries):");
    for entry in &entries {
        println!("- id:         {}", entry.id);
        println!("  command:    {}", entry.command);
        println!("  attempts:   {}", entry.attempts);
        println!(
            "  last error: {}",
            entry.last_error.as_deref().unwrap_or("n/a")
        );
        println!("  moved at:   {}", entry.moved_at.to_rfc3339());
    }

    Ok(())
}

pub async fn handle_purge(store: &JobStore, yes: bool) -> anyhow::Result<()> {
    if !yes && !confirm("Purge all dead-letter entries? (y/N): ")? {
        println!("Aborted, dead-letter queue not purged.");
        return Ok(());
    }

    let purged = store.purge_dlq().await?;
    println!("Purged {purged} dead-letter entries.");
    Ok(())
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{prompt}");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}
