//! fan-admin - Operator CLI for the fancast job queue
//!
//! Inspect queue depth, list failed jobs, and re-queue or clear them.
//! Talks straight to the shared SQLite database, so it works even when
//! fan-serve is down.

use clap::{Parser, Subcommand};
use libfancast::config::Config;
use libfancast::db::Database;
use libfancast::queue::JobQueue;
use libfancast::{FancastError, Result};

#[derive(Parser, Debug)]
#[command(name = "fan-admin")]
#[command(version)]
#[command(about = "Operator CLI for the fancast job queue")]
#[command(long_about = "\
fan-admin - Operator CLI for the fancast job queue

DESCRIPTION:
    fan-admin inspects and repairs the shared job queue. Jobs that
    exhausted their retry budget park in the failed state; use this
    tool to see why they failed and to hand them back to the workers.

COMMANDS:
    metrics       Queue depth broken down by status
    health        Check queue connectivity
    failed        List recently failed jobs with their last error
    retry         Re-queue a failed job (keeps its attempt history)
    clear-failed  Drop all failed jobs

USAGE EXAMPLES:
    # Show queue depth
    fan-admin metrics

    # Same, machine-readable
    fan-admin metrics --format json

    # Inspect the last 10 failures
    fan-admin failed --limit 10

    # Hand job 42 back to the workers
    fan-admin retry 42

CONFIGURATION:
    Configuration file: ~/.config/fancast/config.toml
    Override with FANCAST_CONFIG.

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue depth broken down by status
    Metrics {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check queue connectivity
    Health,

    /// List recently failed jobs
    Failed {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Maximum number of jobs to show
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// Re-queue a failed job
    Retry {
        /// Job ID to retry
        job_id: i64,
    },

    /// Drop all failed jobs
    ClearFailed {
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "error" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;
    let queue = JobQueue::new(db, config.queue.clone());

    match cli.command {
        Commands::Metrics { format } => cmd_metrics(&queue, &format).await?,
        Commands::Health => cmd_health(&queue).await?,
        Commands::Failed { format, limit } => cmd_failed(&queue, &format, limit).await?,
        Commands::Retry { job_id } => cmd_retry(&queue, job_id).await?,
        Commands::ClearFailed { force } => cmd_clear_failed(&queue, force).await?,
    }

    Ok(())
}

fn validate_format(format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        return Err(FancastError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        )));
    }
    Ok(())
}

async fn cmd_metrics(queue: &JobQueue, format: &str) -> Result<()> {
    validate_format(format)?;
    let metrics = queue.metrics().await?;

    if format == "json" {
        println!(
            "{}",
            serde_json::to_string_pretty(&metrics)
                .map_err(|e| FancastError::InvalidInput(e.to_string()))?
        );
    } else {
        println!("waiting:   {}", metrics.waiting);
        println!("active:    {}", metrics.active);
        println!("delayed:   {}", metrics.delayed);
        println!("completed: {}", metrics.completed);
        println!("failed:    {}", metrics.failed);
    }

    Ok(())
}

async fn cmd_health(queue: &JobQueue) -> Result<()> {
    let health = queue.health().await;
    if health.reachable {
        println!("queue: ok ({}ms)", health.latency_ms);
        Ok(())
    } else {
        Err(FancastError::Queue(
            libfancast::QueueError::Unavailable("health check query failed".to_string()),
        ))
    }
}

async fn cmd_failed(queue: &JobQueue, format: &str, limit: u32) -> Result<()> {
    validate_format(format)?;
    let jobs = queue.recent_failed(limit).await?;

    if format == "json" {
        println!(
            "{}",
            serde_json::to_string_pretty(&jobs)
                .map_err(|e| FancastError::InvalidInput(e.to_string()))?
        );
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No failed jobs.");
        return Ok(());
    }

    for job in jobs {
        println!(
            "#{} [{}] attempts={} updated={}",
            job.id,
            job.kind.as_str(),
            job.attempts,
            format_timestamp(job.updated_at),
        );
        if let Some(error) = &job.last_error {
            println!("    {}", error);
        }
    }

    Ok(())
}

async fn cmd_retry(queue: &JobQueue, job_id: i64) -> Result<()> {
    queue.retry(job_id).await?;
    println!("Job {} re-queued.", job_id);
    Ok(())
}

async fn cmd_clear_failed(queue: &JobQueue, force: bool) -> Result<()> {
    if !force {
        let metrics = queue.metrics().await?;
        if metrics.failed == 0 {
            println!("No failed jobs.");
            return Ok(());
        }
        eprint!("Drop {} failed job(s)? [y/N] ", metrics.failed);
        let mut answer = String::new();
        std::io::stdin()
            .read_line(&mut answer)
            .map_err(|e| FancastError::InvalidInput(e.to_string()))?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let cleared = queue.clear_failed().await?;
    println!("Cleared {} failed job(s).", cleared);
    Ok(())
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}
