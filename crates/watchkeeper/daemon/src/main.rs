//! Watchkeeper daemon
//!
//! Polls a snapshot source, runs the decision kernel over every change and
//! keeps the audit trail. Read-only subcommands inspect and prune that
//! trail.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod collaborators;
mod commands;
mod config;
mod error;

use config::DaemonConfig;
use error::DaemonResult;

/// Watchkeeper daemon CLI
#[derive(Parser)]
#[command(name = "watchkeeperd")]
#[command(about = "Watchkeeper - change-driven monitoring agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WATCHKEEPER_CONFIG")]
    config: Option<String>,

    /// SQLite database URL for the audit trail
    #[arg(long, env = "WATCHKEEPER_DATABASE_URL")]
    database_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable JSON logging
    #[arg(long, env = "WATCHKEEPER_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Poll the source and run the decision kernel until interrupted
    Run {
        /// Snapshot endpoint (GET, JSON)
        #[arg(long, env = "WATCHKEEPER_SOURCE_URL")]
        source_url: Option<String>,

        /// Snapshot file (JSON), re-read on every poll
        #[arg(long, conflicts_with = "source_url")]
        source_file: Option<String>,

        /// Analysis provider endpoint
        #[arg(long, env = "WATCHKEEPER_ANALYSIS_URL")]
        analysis_url: Option<String>,

        /// Narrative provider endpoint
        #[arg(long, env = "WATCHKEEPER_NARRATIVE_URL")]
        narrative_url: Option<String>,
    },

    /// Show the most recent runs and skips
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show audit statistics and the intelligence rate
    Stats,

    /// Keep only the most recent runs
    Prune {
        #[arg(short, long)]
        keep: usize,
    },
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = DaemonConfig::load(cli.config.as_deref())?;

    // Initialize tracing
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    init_tracing(&level, cli.log_json || config.logging.json);

    // Override with CLI args
    if let Some(url) = cli.database_url {
        config.storage.database_url = Some(url);
    }

    match cli.command {
        Commands::Run {
            source_url,
            source_file,
            analysis_url,
            narrative_url,
        } => {
            if source_url.is_some() || source_file.is_some() {
                config.source.url = source_url;
                config.source.file = source_file;
            }
            if analysis_url.is_some() {
                config.analysis.url = analysis_url;
            }
            if narrative_url.is_some() {
                config.narrative.url = narrative_url;
            }
            commands::run(config).await
        }
        Commands::History { limit } => {
            let memory = commands::open_memory(&config).await?;
            commands::history(memory.as_ref(), limit).await
        }
        Commands::Stats => {
            let memory = commands::open_memory(&config).await?;
            commands::stats(memory.as_ref()).await
        }
        Commands::Prune { keep } => {
            let memory = commands::open_memory(&config).await?;
            commands::prune(memory.as_ref(), keep).await
        }
    }
}
