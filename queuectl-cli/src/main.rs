//! queuectl - a lightweight CLI-based background job queue.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use queuectl::prelude::*;

mod commands;

#[derive(Parser)]
#[command(name = "queuectl")]
#[command(version, about = "A lightweight CLI-based background job queue")]
struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "QUEUECTL_DB_PATH", default_value = "data/queue.db", global = true)]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Worker and retry tunables, overridable via QUEUECTL_* environment
/// variables.
#[derive(Args, Debug)]
struct QueueOpts {
    /// Number of worker loops to start
    #[arg(long, env = "QUEUECTL_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Default retry ceiling for new jobs
    #[arg(long, env = "QUEUECTL_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Exponential backoff base in seconds
    #[arg(long, env = "QUEUECTL_BACKOFF_BASE", default_value_t = 2)]
    backoff_base: u32,

    /// Idle poll interval in milliseconds
    #[arg(long, env = "QUEUECTL_POLL_INTERVAL_MS", default_value_t = 2000)]
    poll_interval_ms: u64,

    /// Lease age in milliseconds before a processing job may be reclaimed
    #[arg(long, env = "QUEUECTL_LOCK_TIMEOUT_MS", default_value_t = 60_000)]
    lock_timeout_ms: u64,

    /// Per-execution command timeout in milliseconds
    #[arg(long, env = "QUEUECTL_COMMAND_TIMEOUT_MS", default_value_t = 30_000)]
    command_timeout_ms: u64,

    /// Disable the stale-lease reclaim loop
    #[arg(long)]
    no_reclaim: bool,
}

impl QueueOpts {
    fn to_config(&self) -> QueueConfig {
        QueueConfig::builder()
            .workers(self.workers)
            .default_max_retries(self.max_retries)
            .backoff_base(self.backoff_base)
            .poll_interval(Duration::from_millis(self.poll_interval_ms))
            .lock_timeout(Duration::from_millis(self.lock_timeout_ms))
            .command_timeout(Duration::from_millis(self.command_timeout_ms))
            .reclaim_stale(!self.no_reclaim)
            .build()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a shell command to run as a job (wrap the command in quotes)
    Enqueue {
        /// The command to execute
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,

        /// Maximum retries for this job
        #[arg(long, env = "QUEUECTL_MAX_RETRIES", default_value_t = 3)]
        max_retries: u32,
    },

    /// Run workers to process jobs until interrupted
    Run {
        #[command(flatten)]
        opts: QueueOpts,
    },

    /// Show queue status
    Status {
        /// How many eligible pending jobs to list
        #[arg(long, default_value_t = 5)]
        pending: u32,

        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Dead-letter queue management
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Show the effective configuration
    Config {
        #[command(flatten)]
        opts: QueueOpts,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead-letter entries
    List {
        /// Maximum number of entries to show
        #[arg(long, default_value_t = 100)]
        limit: u32,

        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete all dead-letter entries
    Purge {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    tracing::debug!(db_path = %cli.db_path.display(), "queuectl starting");

    match cli.command {
        Commands::Enqueue {
            command,
            max_retries,
        } => {
            let store = JobStore::open(&cli.db_path).await?;
            commands::enqueue::handle(&store, &command, max_retries).await?;
        }
        Commands::Run { opts } => {
            let store = JobStore::open(&cli.db_path).await?;
            commands::run::handle(store, opts.to_config()).await?;
        }
        Commands::Status { pending, json } => {
            let store = JobStore::open(&cli.db_path).await?;
            commands::status::handle(&store, pending, json).await?;
        }
        Commands::Dlq { command } => {
            let store = JobStore::open(&cli.db_path).await?;
            match command {
                DlqCommands::List { limit, json } => {
                    commands::dlq::handle_list(&store, limit, json).await?;
                }
                DlqCommands::Purge { yes } => {
                    commands::dlq::handle_purge(&store, yes).await?;
                }
            }
        }
        Commands::Config { opts } => {
            let config = opts.to_config();
            let effective = serde_json::json!({
                "db_path": cli.db_path,
                "workers": config.workers,
                "default_max_retries": config.default_max_retries,
                "backoff_base": config.backoff_base,
                "poll_interval_ms": config.poll_interval.as_millis() as u64,
                "lock_timeout_ms": config.lock_timeout.as_millis() as u64,
                "command_timeout_ms": config.command_timeout.as_millis() as u64,
                "reclaim_stale": config.reclaim_stale,
            });
            println!("{}", serde_json::to_string_pretty(&effective)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn enqueue_collects_trailing_words() {
        let cli = Cli::parse_from(["queuectl", "enqueue", "echo", "hello", "world"]);
        match cli.command {
            Commands::Enqueue {
                command,
                max_retries,
            } => {
                assert_eq!(command, vec!["echo", "hello", "world"]);
                assert_eq!(max_retries, 3);
            }
            _ => panic!("expected enqueue"),
        }
    }

    #[test]
    fn run_parses_worker_overrides() {
        let cli = Cli::parse_from(["queuectl", "run", "--workers", "4", "--no-reclaim"]);
        match cli.command {
            Commands::Run { opts } => {
                let config = opts.to_config();
                assert_eq!(config.workers, 4);
                assert!(!config.reclaim_stale);
            }
            _ => panic!("expected run"),
        }
    }
}
