//! tally-sync - Background daemon that keeps source analytics fresh
//!
//! Runs every active source's adapter on an interval and records the
//! outcome of each run on the source.

use clap::Parser;
use libtallycast::logging::LoggingConfig;
use libtallycast::{
    AdapterRegistry, Config, Database, DatabaseCredentialStore, FetchContext, Result,
    SyncService, TallyError, Transports,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tally-sync")]
#[command(version)]
#[command(about = "Background daemon that syncs source analytics")]
#[command(long_about = "\
tally-sync - Background daemon that syncs source analytics

DESCRIPTION:
    tally-sync runs one fetch per active source on a fixed interval. Each
    fetch pulls the source's posts and engagement counts, appends a new
    engagement snapshot per post and refreshes the source's averages.

    Sources are synced concurrently, bounded by [sync] workers. A source
    that fails is marked failed with the reason; the others carry on.

USAGE:
    # Run in foreground (logs to stderr)
    tally-sync

    # Sync everything once and exit
    tally-sync --once

    # Sync a single source once
    tally-sync --once --source 6f1c0e3a-...

    # Override the interval
    tally-sync --interval 30m

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current pass)

CONFIGURATION:
    Configuration file: ~/.config/tallycast/config.toml (or $TALLYCAST_CONFIG)
    Stored credentials are decrypted with the passphrase in
    $TALLYCAST_ENCRYPTION_KEY.

    [sync]
    interval = \"6h\"
    workers = 4
    max_retries = 5

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Credential error
    3 - Invalid input
")]
struct Cli {
    /// Sync interval (humantime, e.g. "30m"; overrides config)
    #[arg(long, value_name = "DURATION")]
    interval: Option<String>,

    /// Only sync this source
    #[arg(long, value_name = "SOURCE_ID")]
    source: Option<String>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Run one pass and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let interval = match &cli.interval {
        Some(raw) => humantime::parse_duration(raw)
            .map_err(|e| TallyError::InvalidInput(format!("Invalid --interval {:?}: {}", raw, e)))?,
        None => config.sync.interval()?,
    };

    let db = Database::new(&config.database.path).await?;
    let credentials = DatabaseCredentialStore::from_config(db.clone(), &config.credentials)?;
    let transports = Transports::from_config(&config.http)?;
    let ctx = FetchContext::new(db, Arc::new(credentials), transports)
        .with_max_retries(config.sync.max_retries)
        .with_user_agent(config.http.user_agent.clone());
    let service = SyncService::new(ctx, AdapterRegistry::standard(), config.sync.worker_count());

    info!("tally-sync daemon starting");

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    if cli.once {
        run_pass(&service, cli.source.as_deref()).await?;
        info!("tally-sync: completed one pass, exiting");
    } else {
        info!(interval = %humantime::format_duration(interval), "Sync interval");
        run_daemon_loop(&service, cli.source.as_deref(), interval, shutdown).await;
    }

    info!("tally-sync daemon stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| TallyError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("Received shutdown signal, stopping after the current pass...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

/// One sync pass over a single source or every active source
async fn run_pass(service: &SyncService, source: Option<&str>) -> Result<()> {
    let outcomes = match source {
        Some(id) => vec![service.sync_source(id).await?],
        None => service.sync_all().await?,
    };

    for outcome in &outcomes {
        if outcome.is_success() {
            info!(source_id = %outcome.source_id, network = %outcome.network, "Source synced");
        } else {
            info!(
                source_id = %outcome.source_id,
                network = %outcome.network,
                status = %outcome.status,
                reason = outcome.reason.as_deref().unwrap_or(""),
                "Source not synced"
            );
        }
    }

    Ok(())
}

async fn run_daemon_loop(
    service: &SyncService,
    source: Option<&str>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping daemon loop");
            break;
        }

        if let Err(e) = run_pass(service, source).await {
            error!("Sync pass failed: {}", e);
        }

        // Sleep until the next pass, checking for shutdown every second
        for _ in 0..interval.as_secs().max(1) {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}
