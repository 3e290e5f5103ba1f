//! Worker pool: concurrent polling loops over the shared store.
//!
//! Loops never talk to each other; every cross-loop interaction goes
//! through the store's transactions. Shutdown is cooperative: a loop
//! observes cancellation between iterations, so an in-flight execution
//! always finishes and is resolved before the loop exits.

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::job::Job;
use crate::retry::RetryDecision;
use crate::runner::CommandRunner;
use crate::store::JobStore;

/// Consecutive store faults a loop tolerates before giving up. Job-level
/// failures never count toward this; only storage faults do.
const MAX_CONSECUTIVE_STORE_FAULTS: u32 = 3;

fn generate_pool_id() -> String {
    let id = Uuid::now_v7().simple().to_string();
    format!("pool-{}", &id[..8])
}

/// Pool of independent worker loops plus an optional stale-lease reclaim
/// loop.
pub struct WorkerPool {
    store: JobStore,
    runner: Arc<dyn CommandRunner>,
    config: QueueConfig,
    pool_id: String,
    token: CancellationToken,
}

impl WorkerPool {
    pub fn new(store: JobStore, runner: Arc<dyn CommandRunner>, config: QueueConfig) -> Self {
        Self {
            store,
            runner,
            config,
            pool_id: generate_pool_id(),
            token: CancellationToken::new(),
        }
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// Token that requests shutdown when cancelled. Cloning lets callers
    /// stop the pool from elsewhere.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run until ctrl-c, then drain and stop.
    pub async fn run(self) -> Result<(), QueueError> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run until `shutdown` resolves, let in-flight executions finish,
    /// and join every loop before returning.
    ///
    /// Returns the first storage fault if any loop aborted on a poisoned
    /// store; such an abort also triggers shutdown of the other loops.
    pub async fn run_until<S>(self, shutdown: S) -> Result<(), QueueError>
    where
        S: Future<Output = ()>,
    {
        let policy = BackoffPolicy::new(self.config.backoff_base);
        let mut tasks: JoinSet<Result<(), QueueError>> = JoinSet::new();

        if self.config.reclaim_stale {
            tasks.spawn(reclaim_loop(
                self.store.clone(),
                self.config.clone(),
                self.token.clone(),
            ));
        }

        for index in 1..=self.config.workers {
            let name = format!("{}/{}", self.pool_id, index);
            tasks.spawn(worker_loop(
                self.store.clone(),
                self.runner.clone(),
                policy,
                self.config.clone(),
                name,
                self.token.clone(),
            ));
        }

        tracing::info!(
            pool_id = %self.pool_id,
            workers = self.config.workers,
            "Worker pool started"
        );

        let mut first_fault: Option<QueueError> = None;

        tokio::select! {
            _ = shutdown => {
                tracing::info!(pool_id = %self.pool_id, "Shutdown requested, draining");
            }
            // A loop only finishes early when its store fault budget is
            // exhausted; bring the rest of the pool down with it.
            joined = tasks.join_next() => {
                if let Some(result) = joined {
                    collect_fault(result, &mut first_fault);
                }
            }
        }
        self.token.cancel();

        while let Some(result) = tasks.join_next().await {
            collect_fault(result, &mut first_fault);
        }

        tracing::info!(pool_id = %self.pool_id, "Worker pool stopped");
        match first_fault {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn collect_fault(
    result: Result<Result<(), QueueError>, tokio::task::JoinError>,
    first_fault: &mut Option<QueueError>,
) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            if first_fault.is_none() {
                *first_fault = Some(error);
            }
        }
        Err(join_error) => {
            tracing::error!(error = %join_error, "Worker task panicked");
            if first_fault.is_none() {
                *first_fault = Some(QueueError::Database(anyhow::anyhow!(join_error)));
            }
        }
    }
}

async fn worker_loop(
    store: JobStore,
    runner: Arc<dyn CommandRunner>,
    policy: BackoffPolicy,
    config: QueueConfig,
    name: String,
    token: CancellationToken,
) -> Result<(), QueueError> {
    tracing::debug!(worker = %name, "Worker started");
    let mut consecutive_faults = 0u32;

    while !token.is_cancelled() {
        match store.claim_one_for(&name).await {
            Ok(Some(job)) => {
                consecutive_faults = 0;
                match process_one(&store, runner.as_ref(), &policy, &name, job).await {
                    Ok(()) => {}
                    Err(error) if error.is_not_found() => {
                        // Resolved concurrently, e.g. reclaimed after a
                        // long execution. Nothing left to do.
                        tracing::debug!(worker = %name, "Job was resolved elsewhere");
                    }
                    Err(error) => {
                        consecutive_faults += 1;
                        if consecutive_faults >= MAX_CONSECUTIVE_STORE_FAULTS {
                            tracing::error!(worker = %name, error = %error, "Store fault budget exhausted, stopping worker");
                            return Err(error);
                        }
                        tracing::error!(worker = %name, error = %error, "Store fault while resolving job, backing off");
                        idle(&config, &token).await;
                    }
                }
            }
            Ok(None) => {
                consecutive_faults = 0;
                idle(&config, &token).await;
            }
            Err(error) => {
                consecutive_faults += 1;
                if consecutive_faults >= MAX_CONSECUTIVE_STORE_FAULTS {
                    tracing::error!(worker = %name, error = %error, "Store fault budget exhausted, stopping worker");
                    return Err(error);
                }
                tracing::error!(worker = %name, error = %error, "Failed to poll for a job, backing off");
                idle(&config, &token).await;
            }
        }
    }

    tracing::debug!(worker = %name, "Worker stopped");
    Ok(())
}

/// Sleep one poll interval, waking early on shutdown.
async fn idle(config: &QueueConfig, token: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(config.poll_interval) => {}
        _ = token.cancelled() => {}
    }
}

/// Execute a claimed job and apply exactly one resolving transition:
/// completion, reschedule, or dead-letter transfer.
async fn process_one(
    store: &JobStore,
    runner: &dyn CommandRunner,
    policy: &BackoffPolicy,
    worker: &str,
    job: Job,
) -> Result<(), QueueError> {
    tracing::info!(worker, job_id = %job.id, command = %job.command, "Executing job");

    let outcome = runner.run(&job.command).await;

    if outcome.success {
        let found = store
            .mark_completed(job.id, Some(&outcome.stdout), Some(&outcome.stderr))
            .await?;
        if found {
            tracing::info!(worker, job_id = %job.id, "Job completed");
        }
        return Ok(());
    }

    let reason = outcome
        .error
        .unwrap_or_else(|| "command failed".to_string());
    let attempts_now = job.attempts + 1;

    match RetryDecision::decide(attempts_now, job.max_retries, policy) {
        RetryDecision::Dlq => {
            store.transfer_to_dlq(job.id, &reason).await?;
            tracing::warn!(
                worker,
                job_id = %job.id,
                attempts = attempts_now,
                "Retries exhausted, job dead-lettered"
            );
        }
        RetryDecision::Retry { delay } => {
            store.reschedule_after_failure(job.id, &reason, delay).await?;
            tracing::info!(
                worker,
                job_id = %job.id,
                attempt = attempts_now,
                max_retries = job.max_retries,
                delay_secs = delay.as_secs(),
                "Job failed, retry scheduled"
            );
        }
    }

    Ok(())
}

/// Periodically return abandoned leases to the backlog. The first pass
/// runs immediately, picking up leftovers from a previous crashed
/// process.
async fn reclaim_loop(
    store: JobStore,
    config: QueueConfig,
    token: CancellationToken,
) -> Result<(), QueueError> {
    let mut interval = tokio::time::interval(config.lock_timeout);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut consecutive_faults = 0u32;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match store.reclaim_stale(config.lock_timeout).await {
                    Ok(_) => consecutive_faults = 0,
                    Err(error) => {
                        consecutive_faults += 1;
                        if consecutive_faults >= MAX_CONSECUTIVE_STORE_FAULTS {
                            tracing::error!(error = %error, "Store fault budget exhausted, stopping reclaim loop");
                            return Err(error);
                        }
                        tracing::error!(error = %error, "Reclaim pass failed");
                    }
                }
            }
            _ = token.cancelled() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ExecOutcome;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Runner that pops pre-scripted outcomes; repeats the last behavior
    /// (success) once the script is exhausted.
    struct ScriptedRunner {
        script: Mutex<VecDeque<ExecOutcome>>,
    }

    impl ScriptedRunner {
        fn new(outcomes: Vec<ExecOutcome>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(outcomes.into()),
            })
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, _command: &str) -> ExecOutcome {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ExecOutcome::ok(String::new(), String::new()))
        }
    }

    /// Runner that succeeds after a fixed delay.
    struct SlowRunner {
        delay: Duration,
    }

    #[async_trait]
    impl CommandRunner for SlowRunner {
        async fn run(&self, _command: &str) -> ExecOutcome {
            tokio::time::sleep(self.delay).await;
            ExecOutcome::ok("slow\n".into(), String::new())
        }
    }

    fn test_config() -> QueueConfig {
        QueueConfig::builder()
            .poll_interval(Duration::from_millis(10))
            .backoff_base(1)
            .workers(2)
            .build()
    }

    async fn wait_until<F, Fut>(mut probe: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                if probe().await {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn pool_completes_a_successful_job() {
        let store = JobStore::in_memory().await.unwrap();
        store.insert("echo hi", 3).await.unwrap();

        let runner = ScriptedRunner::new(vec![ExecOutcome::ok("hi\n".into(), String::new())]);
        let pool = WorkerPool::new(store.clone(), runner, test_config());

        let probe = store.clone();
        pool.run_until(async move {
            wait_until(|| {
                let store = probe.clone();
                async move { store.stats().await.unwrap().completed == 1 }
            })
            .await;
        })
        .await
        .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.dlq, 0);
    }

    #[tokio::test]
    async fn pool_dead_letters_job_with_no_retry_budget() {
        let store = JobStore::in_memory().await.unwrap();
        let job = store.insert("definitely-broken", 1).await.unwrap();

        let runner = ScriptedRunner::new(vec![ExecOutcome::failed(
            "command failed: exit status: 7",
            String::new(),
            String::new(),
        )]);
        let pool = WorkerPool::new(store.clone(), runner, test_config());

        let probe = store.clone();
        pool.run_until(async move {
            wait_until(|| {
                let store = probe.clone();
                async move { store.stats().await.unwrap().dlq == 1 }
            })
            .await;
        })
        .await
        .unwrap();

        let entries = store.list_dlq(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, job.id);
        assert_eq!(entries[0].attempts, 1);
        assert_eq!(
            entries[0].last_error.as_deref(),
            Some("command failed: exit status: 7")
        );
        assert_eq!(store.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn pool_retries_with_backoff_then_dead_letters() {
        let store = JobStore::in_memory().await.unwrap();
        let job = store.insert("flaky", 2).await.unwrap();

        let runner = ScriptedRunner::new(vec![
            ExecOutcome::failed("first failure", String::new(), String::new()),
            ExecOutcome::failed("second failure", String::new(), String::new()),
        ]);
        let pool = WorkerPool::new(store.clone(), runner, test_config());

        let probe = store.clone();
        pool.run_until(async move {
            wait_until(|| {
                let store = probe.clone();
                async move { store.stats().await.unwrap().dlq == 1 }
            })
            .await;
        })
        .await
        .unwrap();

        let entries = store.list_dlq(10).await.unwrap();
        assert_eq!(entries[0].id, job.id);
        assert_eq!(entries[0].attempts, 2, "both failures are recorded");
        assert_eq!(entries[0].last_error.as_deref(), Some("second failure"));
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_job_finish() {
        let store = JobStore::in_memory().await.unwrap();
        store.insert("slow", 3).await.unwrap();

        let runner = Arc::new(SlowRunner {
            delay: Duration::from_millis(300),
        });
        let config = QueueConfig::builder()
            .poll_interval(Duration::from_millis(10))
            .workers(1)
            .build();
        let pool = WorkerPool::new(store.clone(), runner, config);

        let probe = store.clone();
        pool.run_until(async move {
            // Return once the job is claimed, i.e. mid-execution.
            wait_until(|| {
                let store = probe.clone();
                async move { store.stats().await.unwrap().processing == 1 }
            })
            .await;
        })
        .await
        .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.completed, 1, "in-flight job resolved before exit");
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn pool_aborts_when_the_store_is_poisoned() {
        let store = JobStore::in_memory().await.unwrap();
        let runner = ScriptedRunner::new(vec![]);
        let config = QueueConfig::builder()
            .poll_interval(Duration::from_millis(5))
            .workers(1)
            .reclaim_stale(false)
            .build();
        let pool = WorkerPool::new(store.clone(), runner, config);

        store.close().await;

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            pool.run_until(std::future::pending()),
        )
        .await
        .expect("pool did not abort");

        assert!(matches!(result, Err(QueueError::Database(_))));
    }
}
