//! fan-worker - Background worker for the fancast job queue
//!
//! Claims jobs from the queue and executes them: publishing posts,
//! pulling engagement, probing platform health, and generating reports.
//! Run as many instances as you need; the claim protocol guarantees a
//! job is only ever held by one worker at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

use libfancast::config::Config;
use libfancast::db::Database;
use libfancast::limiter::{PlatformBudget, TenantQuota};
use libfancast::logging::{LogFormat, LoggingConfig};
use libfancast::platforms::PlatformRegistry;
use libfancast::queue::JobQueue;
use libfancast::tokens::TokenManager;
use libfancast::vault::CredentialVault;
use libfancast::worker::Worker;
use libfancast::Result;

#[derive(Parser, Debug)]
#[command(name = "fan-worker")]
#[command(version)]
#[command(about = "Background worker for the fancast job queue")]
#[command(long_about = "\
fan-worker - Background worker for the fancast job queue

DESCRIPTION:
    fan-worker is a long-running daemon that claims jobs from the shared
    SQLite queue and executes them. It publishes due posts to their
    platforms, pulls engagement metrics, runs platform health probes,
    and generates tenant reports.

    Failed jobs retry with exponential backoff until the attempt cap,
    after which they park in the failed state for operator inspection
    (see fan-admin). A reaper pass at the start of each poll returns
    jobs abandoned by crashed workers to the queue.

USAGE:
    # Run in foreground (logs to stderr)
    fan-worker

    # Run with a faster poll interval
    fan-worker --poll-interval 5

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current job)

CONFIGURATION:
    Configuration file: ~/.config/fancast/config.toml
    Override with FANCAST_CONFIG.

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Database or configuration error
")]
struct Cli {
    /// Seconds to sleep when the queue is empty
    #[arg(long, value_name = "SECONDS", default_value_t = 10)]
    poll_interval: u64,

    /// Concurrent job executors per poll
    #[arg(long, value_name = "N", default_value_t = 1)]
    concurrency: usize,

    /// Log output format: text, json, or pretty
    #[arg(long, value_name = "FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Drain the queue once and exit (for testing)
    #[arg(long, hide = true)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::new(cli.log_format, "info".to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;

    let queue = JobQueue::new(db.clone(), config.queue.clone());
    let vault = Arc::new(CredentialVault::open(&db).await?);
    let registry = Arc::new(PlatformRegistry::standard(&config.platforms));
    let tokens = Arc::new(TokenManager::new(
        db.clone(),
        vault,
        registry.clone(),
        config.tokens.refresh_threshold_secs as u64,
    ));

    let worker = Arc::new(Worker::new(
        db.clone(),
        queue.clone(),
        registry,
        tokens,
        Arc::new(PlatformBudget::standard()),
        Arc::new(TenantQuota::new(db.clone())),
        config.poller.health_failure_threshold,
    ));

    info!("fan-worker starting");

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let concurrency = cli.concurrency.max(1);

    if cli.once {
        let now = chrono::Utc::now().timestamp();
        queue.reap_expired(now).await?;
        let handled = drain(worker.clone(), concurrency, shutdown.clone()).await;
        info!(handled, "drained queue once, exiting");
        return Ok(());
    }

    info!(
        poll_interval = cli.poll_interval,
        concurrency, "entering worker loop"
    );
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("shutdown requested, stopping worker loop");
            break;
        }

        let now = chrono::Utc::now().timestamp();
        match queue.reap_expired(now).await {
            Ok(0) => {}
            Ok(reaped) => info!(reaped, "returned abandoned jobs to the queue"),
            Err(e) => error!("reaper pass failed: {}", e),
        }

        drain(worker.clone(), concurrency, shutdown.clone()).await;

        // Sleep until the next poll, waking early on shutdown.
        for _ in 0..cli.poll_interval {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    info!("fan-worker stopped");
    Ok(())
}

/// Work the queue until it is empty or shutdown is requested.
async fn drain(worker: Arc<Worker>, concurrency: usize, shutdown: Arc<AtomicBool>) -> u64 {
    let mut executors = Vec::with_capacity(concurrency);
    for _ in 0..concurrency {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        executors.push(tokio::spawn(async move {
            let mut handled: u64 = 0;
            while !shutdown.load(Ordering::Relaxed) {
                match worker.poll_once().await {
                    Ok(Some(_)) => handled += 1,
                    Ok(None) => break,
                    Err(e) => {
                        // A broken job handler should not kill the
                        // daemon; the job stays claimed and the reaper
                        // will recover it.
                        error!("job execution error: {}", e);
                        break;
                    }
                }
            }
            handled
        }));
    }

    let mut handled = 0;
    for executor in executors {
        handled += executor.await.unwrap_or(0);
    }
    handled
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use libfancast::FancastError;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| FancastError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    let shutdown_clone = shutdown.clone();
    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGTERM | SIGINT => {
                    info!("Received shutdown signal, stopping gracefully...");
                    shutdown_clone.store(true, Ordering::Relaxed);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}

/// Non-unix targets get ctrl-c handling only.
#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}
