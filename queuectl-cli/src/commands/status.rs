//! Status command handler: aggregate counts plus a bounded snapshot of
//! the eligible backlog.

use queuectl::prelude::*;

pub async fn handle(store: &JobStore, pending_limit: u32, json: bool) -> anyhow::Result<()> {
    let stats = store.stats().await?;
    let eligible = store.fetch_eligible(pending_limit).await?;

    if json {
        let payload = serde_json::json!({
            "stats": stats,
            "eligible": eligible,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("Queue status");
    println!("------------");
    println!("{:<12} : {}", "total", stats.total);
    println!("{:<12} : {}", "pending", stats.pending);
    println!("{:<12} : {}", "processing", stats.processing);
    println!("{:<12} : {}", "completed", stats.completed);
    println!("{:<12} : {}", "dlq", stats.dlq);

    if !eligible.is_empty() {
        println!();
        println!("Eligible jobs (up to {pending_limit}):");
        for job in &eligible {
            println!(
                "  {} | {} | attempts={}/{} | next_run_at={}",
                job.id,
                job.command,
                job.attempts,
                job.max_retries,
                job.next_run_at.to_rfc3339()
            );
        }
    }

    Ok(())
}
