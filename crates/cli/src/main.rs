// Raytask CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Pool sizing flags fall back to RAYTASK_* environment variables.
// Design Decision: Support text/json output formats for scripting.

mod commands;
mod output;
mod telemetry;

use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use raytask_pool::{PoolConfig, ShutdownMode};
use tokio_util::sync::CancellationToken;

use commands::batch::BatchArgs;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "raytask")]
#[command(about = "Raytask - drive task batches through a bounded worker pool")]
#[command(version)]
pub struct Cli {
    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(flatten)]
    pub pool: PoolArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args)]
pub struct PoolArgs {
    /// Number of workers (0 = twice the available parallelism)
    #[arg(long, env = "RAYTASK_WORKER_CONCURRENCY", default_value_t = 0)]
    pub workers: usize,

    /// Task queue capacity (0 = 1000 per worker)
    #[arg(long, env = "RAYTASK_QUEUE_SIZE", default_value_t = 0)]
    pub queue_size: usize,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a synthetic batch and print its summary
    Batch {
        /// Number of tasks in the batch
        #[arg(long, default_value_t = 100)]
        tasks: usize,

        /// Simulated work per task in milliseconds
        #[arg(long, default_value_t = 5)]
        work_ms: u64,

        /// Every n-th task reports an error (0 = never)
        #[arg(long, default_value_t = 0)]
        fail_every: usize,

        /// Every n-th task panics (0 = never)
        #[arg(long, default_value_t = 0)]
        panic_every: usize,

        /// Run the batch on a foreground pool instead of a background one
        #[arg(long)]
        foreground: bool,

        /// How to shut the pool down afterwards
        #[arg(long, default_value = "hard", value_parser = ["light", "soft", "hard"])]
        shutdown: String,

        /// Per-task cooperative timeout in milliseconds
        #[arg(long)]
        task_timeout_ms: Option<u64>,
    },

    /// Show the resolved pool configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    telemetry::init_tracing(cli.quiet);

    let output = OutputFormat::parse(&cli.output);
    let config = PoolConfig::from_env()
        .with_worker_concurrency(cli.pool.workers)
        .with_task_queue_size(cli.pool.queue_size);

    match cli.command {
        Commands::Config => commands::config::run(&config, output),
        Commands::Batch {
            tasks,
            work_ms,
            fail_every,
            panic_every,
            foreground,
            shutdown,
            task_timeout_ms,
        } => {
            let args = BatchArgs {
                tasks,
                work: Duration::from_millis(work_ms),
                fail_every,
                panic_every,
                foreground,
                shutdown: shutdown.parse::<ShutdownMode>().map_err(anyhow::Error::msg)?,
                task_timeout: task_timeout_ms.map(Duration::from_millis),
            };

            // Ctrl-C cancels the root scope; the pool drains and the batch
            // reports the tasks finished so far.
            let root = CancellationToken::new();
            let signal_root = root.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Received shutdown signal");
                    signal_root.cancel();
                }
            });

            commands::batch::run(&args, config, output, &root).await
        }
    }
}
