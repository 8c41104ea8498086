//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod cache;
mod compare;
mod diff;
#[cfg(feature = "browser")]
mod fetch;
mod profile;
mod snapshot;
mod track;
mod webhook;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use bumi::config::Settings;
use bumi::webhook::EVENT_SCRAPE_COMPLETE;

#[derive(Parser)]
#[command(name = "bumi")]
#[command(about = "Browser pool, snapshot and change tracking toolkit for profile scraping")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Render pages in the browser pool and save their HTML
    #[cfg(feature = "browser")]
    Fetch {
        /// URLs or usernames to fetch
        #[arg(required = true)]
        targets: Vec<String>,
        /// Directory to write HTML files into
        #[arg(short, long, default_value = "pages")]
        out: PathBuf,
        /// CSS selector to wait for before reading the page
        #[arg(long)]
        wait_for: Option<String>,
        /// Skip the result cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Manage the result cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Manage stored snapshots
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },

    /// Show the differences between two JSON documents
    Diff {
        /// Older document
        old: PathBuf,
        /// Newer document
        new: PathBuf,
        /// Classify changes into watchlist, favourite and profile changes
        #[arg(short, long)]
        profile: bool,
    },

    /// Compare a capture against the latest snapshot and store it
    Track {
        /// Subject id (usually a username)
        subject: String,
        /// JSON file with the fresh capture
        file: PathBuf,
    },

    /// Compare two users' collections
    Compare {
        /// JSON array of items for the first user (file stem is the user name)
        first: PathBuf,
        /// JSON array of items for the second user
        second: PathBuf,
        /// Field identifying an item
        #[arg(short, long, default_value = bumi::compare::DEFAULT_KEY)]
        key: String,
        /// Show items the second user has that the first does not
        #[arg(short, long)]
        recommendations: bool,
    },

    /// Print the canonical profile URL for a username or profile link
    ProfileUrl {
        /// Username or profile URL
        input: String,
    },

    /// Inspect and test configured webhooks
    Webhook {
        #[command(subcommand)]
        command: WebhookCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Remove every cache entry
    Clear,
    /// Remove expired cache entries
    Sweep {
        /// Entry lifetime in seconds (defaults to the configured TTL)
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Print a cached value
    Get {
        /// Cache key
        key: String,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Store a JSON file as a new snapshot
    Save {
        /// Subject id
        subject: String,
        /// JSON file to store
        file: PathBuf,
    },
    /// Print the most recent snapshot
    Latest {
        /// Subject id
        subject: String,
    },
    /// List snapshots for a subject, oldest first
    List {
        /// Subject id
        subject: String,
    },
}

#[derive(Subcommand)]
enum WebhookCommands {
    /// List configured webhooks
    List,
    /// Send a test event to every subscribed webhook
    Test {
        /// Event to send
        #[arg(short, long, default_value = EVENT_SCRAPE_COMPLETE)]
        event: String,
    },
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        #[cfg(feature = "browser")]
        Commands::Fetch {
            targets,
            out,
            wait_for,
            no_cache,
        } => fetch::cmd_fetch(&settings, &targets, &out, wait_for.as_deref(), no_cache).await,
        Commands::Cache { command } => match command {
            CacheCommands::Clear => cache::cmd_cache_clear(&settings),
            CacheCommands::Sweep { ttl } => cache::cmd_cache_sweep(&settings, ttl),
            CacheCommands::Get { key } => cache::cmd_cache_get(&settings, &key),
        },
        Commands::Snapshot { command } => match command {
            SnapshotCommands::Save { subject, file } => {
                snapshot::cmd_snapshot_save(&settings, &subject, &file)
            }
            SnapshotCommands::Latest { subject } => {
                snapshot::cmd_snapshot_latest(&settings, &subject)
            }
            SnapshotCommands::List { subject } => snapshot::cmd_snapshot_list(&settings, &subject),
        },
        Commands::Diff { old, new, profile } => diff::cmd_diff(&old, &new, profile),
        Commands::Track { subject, file } => track::cmd_track(&settings, &subject, &file).await,
        Commands::Compare {
            first,
            second,
            key,
            recommendations,
        } => compare::cmd_compare(&first, &second, &key, recommendations),
        Commands::ProfileUrl { input } => profile::cmd_profile_url(&input),
        Commands::Webhook { command } => match command {
            WebhookCommands::List => webhook::cmd_webhook_list(&settings),
            WebhookCommands::Test { event } => webhook::cmd_webhook_test(&settings, &event).await,
        },
    }
}
