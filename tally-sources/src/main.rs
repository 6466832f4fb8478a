//! tally-sources - Source management tool for Tallycast
//!
//! Adds and removes tracked sources, stores their credentials, manages
//! exclusions and shows the aggregated stats of a source.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libtallycast::config::Config;
use libtallycast::credentials::{CredentialStore, DatabaseCredentialStore, SourceToken};
use libtallycast::db::Database;
use libtallycast::logging::LoggingConfig;
use libtallycast::sources::mastodon::split_handle;
use libtallycast::types::{Network, Source};
use libtallycast::urls::profile_url;
use libtallycast::TallyError;
use std::io::{self, Read, Write};
use tracing::error;

#[derive(Parser)]
#[command(name = "tally-sources")]
#[command(version)]
#[command(about = "Manage the sources Tallycast tracks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Track a new source
    Add {
        /// Network (reddit, threads, twitch, deviantart, e621, furaffinity,
        /// weasyl, mastodon, search_console)
        network: String,

        /// Account name on the network (user@instance for Mastodon)
        username: String,
    },

    /// List tracked sources
    List {
        /// Only show sources on this network
        #[arg(long)]
        network: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Stop tracking a source and delete everything stored for it
    Remove {
        /// Source ID
        source: String,

        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Resume syncing a source
    Activate {
        /// Source ID
        source: String,
    },

    /// Stop syncing a source without deleting its data
    Deactivate {
        /// Source ID
        source: String,
    },

    /// Store the credentials a source's network needs
    ///
    /// Values starting with '@' are read from the named file, which is how
    /// a Search Console service account key is usually supplied.
    SetCredentials {
        /// Source ID
        source: String,

        /// Read one value per line from stdin (for automation)
        #[arg(long)]
        stdin: bool,
    },

    /// Never ingest an item again
    Exclude {
        /// Source ID
        source: String,

        /// The item's ID on the network
        network_id: String,
    },

    /// Undo an exclusion
    Include {
        /// Source ID
        source: String,

        /// The item's ID on the network
        network_id: String,
    },

    /// Show the aggregated stats of a source
    Stats {
        /// Source ID
        source: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    LoggingConfig::from_env_or("warn", cli.verbose).init();

    if let Err(e) = run_command(cli.command).await {
        error!("{:#}", e);
        let code = e
            .downcast_ref::<TallyError>()
            .map(TallyError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }

    Ok(())
}

async fn run_command(command: Commands) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;

    match command {
        Commands::Add { network, username } => add_source(&db, &network, &username).await,
        Commands::List { network, json } => list_sources(&db, network.as_deref(), json).await,
        Commands::Remove { source, force } => remove_source(&db, &source, force).await,
        Commands::Activate { source } => set_active(&db, &source, true).await,
        Commands::Deactivate { source } => set_active(&db, &source, false).await,
        Commands::SetCredentials { source, stdin } => {
            let store = DatabaseCredentialStore::from_config(db.clone(), &config.credentials)?;
            set_credentials(&db, &store, &source, stdin).await
        }
        Commands::Exclude { source, network_id } => {
            let source = load_source(&db, &source).await?;
            db.add_exclusion(&source.id, &network_id).await?;
            println!("✓ Excluded {} from {}", network_id, describe(&source));
            Ok(())
        }
        Commands::Include { source, network_id } => {
            let source = load_source(&db, &source).await?;
            if db.remove_exclusion(&source.id, &network_id).await? {
                println!("✓ {} will be ingested again for {}", network_id, describe(&source));
            } else {
                println!("{} was not excluded for {}", network_id, describe(&source));
            }
            Ok(())
        }
        Commands::Stats { source } => show_stats(&db, &source).await,
    }
}

fn describe(source: &Source) -> String {
    format!("{} ({})", source.username, source.network.display_name())
}

async fn load_source(db: &Database, source_id: &str) -> Result<Source> {
    match db.get_source(source_id).await? {
        Some(source) => Ok(source),
        None => Err(TallyError::InvalidInput(format!(
            "Source not found: {}. Run 'tally-sources list' to see source IDs.",
            source_id
        ))
        .into()),
    }
}

async fn add_source(db: &Database, network: &str, username: &str) -> Result<()> {
    let network: Network = network.parse()?;
    let username = username.trim();
    if username.is_empty() {
        return Err(TallyError::InvalidInput("Username cannot be empty".to_string()).into());
    }
    if network == Network::Mastodon {
        split_handle(username)?;
    }

    if let Some(existing) = db.find_source(network, username).await? {
        return Err(TallyError::InvalidInput(format!(
            "{} is already tracked as source {}",
            describe(&existing),
            existing.id
        ))
        .into());
    }

    let source = Source::new(network, username);
    db.create_source(&source).await?;
    println!("{}", source.id);

    if !network.credential_slots().is_empty() {
        eprintln!(
            "Next: store credentials with 'tally-sources set-credentials {}'",
            source.id
        );
    }
    Ok(())
}

async fn list_sources(db: &Database, network: Option<&str>, json: bool) -> Result<()> {
    let filter: Option<Network> = network.map(str::parse).transpose()?;
    let sources: Vec<Source> = db
        .list_sources()
        .await?
        .into_iter()
        .filter(|s| filter.map_or(true, |n| s.network == n))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&sources)?);
        return Ok(());
    }

    if sources.is_empty() {
        println!("No sources tracked yet. Add one with 'tally-sources add <network> <username>'.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<14}  {:<24}  {:<6}  STATUS",
        "ID", "NETWORK", "USERNAME", "ACTIVE"
    );
    for source in &sources {
        let status = match &source.status_reason {
            Some(reason) => format!("{} ({})", source.sync_status, reason),
            None => source.sync_status.to_string(),
        };
        println!(
            "{:<36}  {:<14}  {:<24}  {:<6}  {}",
            source.id,
            source.network,
            source.username,
            if source.active { "yes" } else { "no" },
            status
        );
    }
    Ok(())
}

async fn remove_source(db: &Database, source_id: &str, force: bool) -> Result<()> {
    let source = load_source(db, source_id).await?;

    if !force && atty::is(atty::Stream::Stdin) {
        print!(
            "Delete {} and all of its posts, snapshots and stats? [y/N]: ",
            describe(&source)
        );
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !matches!(input.trim(), "y" | "Y" | "yes") {
            println!("Cancelled");
            return Ok(());
        }
    }

    db.delete_source(&source.id).await?;
    println!("✓ Removed {}", describe(&source));
    Ok(())
}

async fn set_active(db: &Database, source_id: &str, active: bool) -> Result<()> {
    let source = load_source(db, source_id).await?;
    db.set_source_active(&source.id, active).await?;

    let state = if active { "activated" } else { "deactivated" };
    println!("✓ {} {}", describe(&source), state);
    Ok(())
}

/// A value starting with '@' names a file to read the value from
fn resolve_value(raw: &str) -> Result<String> {
    match raw.strip_prefix('@') {
        Some(path) => {
            let path = shellexpand::tilde(path.trim()).to_string();
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read credential file {}", path))?;
            Ok(content.trim().to_string())
        }
        None => Ok(raw.trim().to_string()),
    }
}

async fn set_credentials(
    db: &Database,
    store: &dyn CredentialStore,
    source_id: &str,
    use_stdin: bool,
) -> Result<()> {
    let source = load_source(db, source_id).await?;
    let slots = source.network.credential_slots();
    if slots.is_empty() {
        println!(
            "{} sources need no credentials",
            source.network.display_name()
        );
        return Ok(());
    }

    let mut values: [String; 4] = Default::default();
    if use_stdin {
        // Explicit stdin mode: one line per slot, in order
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        let mut lines = buffer.lines();
        for slot in slots {
            values[slot.index] = resolve_value(lines.next().unwrap_or(""))?;
        }
    } else {
        if !atty::is(atty::Stream::Stdin) {
            anyhow::bail!(
                "Not a TTY. Use --stdin flag to read credentials from stdin for automation."
            );
        }

        println!("Credentials for {}", describe(&source));
        for slot in slots {
            let prompt = format!("{}: ", slot.label);
            let raw = if slot.secret {
                rpassword::prompt_password(&prompt)?
            } else {
                print!("{}", prompt);
                io::stdout().flush()?;
                let mut input = String::new();
                io::stdin().read_line(&mut input)?;
                input
            };
            values[slot.index] = resolve_value(&raw)?;
        }
    }

    if let Some(required) = slots.iter().find(|s| s.secret && values[s.index].is_empty()) {
        return Err(
            TallyError::InvalidInput(format!("{} cannot be empty", required.label)).into(),
        );
    }

    let token = SourceToken::new(values.each_ref().map(String::as_str));
    store.set_source_token(&source.id, &token).await?;
    println!(
        "✓ Stored credentials for {} ({} backend)",
        describe(&source),
        store.backend_name()
    );
    Ok(())
}

fn format_average(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.2}", v))
}

fn format_count(value: Option<i64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| v.to_string())
}

async fn show_stats(db: &Database, source_id: &str) -> Result<()> {
    let source = load_source(db, source_id).await?;

    println!("Source:    {}", describe(&source));
    if let Ok(url) = profile_url(source.network, &source.username) {
        println!("Profile:   {}", url);
    }
    println!("Status:    {}", source.sync_status);
    println!("Posts:     {}", db.count_posts(&source.id).await?);
    println!("Snapshots: {}", db.count_reactions_for_source(&source.id).await?);

    match db.get_source_stats(&source.id).await? {
        Some(stats) => {
            let summary = stats.summary;
            println!("Avg likes:   {}", format_average(summary.avg_likes));
            println!("Avg reposts: {}", format_average(summary.avg_reposts));
            println!("Avg views:   {}", format_average(summary.avg_views));
            println!("Followers:   {}", format_count(summary.followers));
            println!("Following:   {}", format_count(summary.following));
            if let Some(updated) = chrono::DateTime::from_timestamp(stats.updated_at, 0) {
                println!("Updated:     {}", updated.to_rfc3339());
            }
        }
        None => println!("No stats yet; run tally-sync first."),
    }
    Ok(())
}
