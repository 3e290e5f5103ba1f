//! Run command handler: start the worker pool until interrupted.

use std::sync::Arc;

use queuectl::prelude::*;

pub async fn handle(store: JobStore, config: QueueConfig) -> anyhow::Result<()> {
    let runner = Arc::new(ShellRunner::new(config.command_timeout));
    let pool = WorkerPool::new(store, runner, config);

    println!("Starting worker pool {} (ctrl-c to stop)", pool.pool_id());
    pool.run().await?;
    println!("All workers stopped.");
    Ok(())
}
