use anyhow::Result;
use clap::{Parser, Subcommand};

use recap_core::{Core, RecapPaths, Source, SummaryKind, TimeFilter};

mod commands;

#[derive(Parser)]
#[command(name = "recap")]
#[command(about = "Cached summaries of your chat, mail and workspace.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize one source
    Summary {
        /// Source to summarize (chat, mail, workspace)
        #[arg(value_name = "SOURCE")]
        source: Source,

        /// today, week or actions
        #[arg(long, short, default_value = "today")]
        kind: SummaryKind,

        /// Ignore the cache and summarize now
        #[arg(long)]
        refresh: bool,
    },

    /// Daily digest across every connected source
    Digest {
        #[arg(long)]
        refresh: bool,
    },

    /// Live activity view of every source, without summarizing
    Overview {
        /// all, today, week or month
        #[arg(long, short, default_value = "today")]
        filter: TimeFilter,
    },

    /// Pull new items into the local store
    Sync {
        /// Sources to sync. If omitted, syncs every enabled source.
        #[arg(value_name = "SOURCES")]
        sources: Vec<Source>,

        /// Ignore the watermark and re-scan the whole window
        #[arg(long)]
        full: bool,
    },

    /// Show watermarks, record counts and cache ages
    Status,

    /// Store an access token for a source
    Connect {
        #[arg(value_name = "SOURCE")]
        source: Source,

        #[arg(value_name = "TOKEN")]
        token: String,
    },

    /// Remove a source's token and reset its sync watermark
    Disconnect {
        #[arg(value_name = "SOURCE")]
        source: Source,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Debug logs are hidden by default
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let paths = RecapPaths::from_env();
    let core = Core::init(&paths).await?;

    let outcome = match cli.command {
        Commands::Summary {
            source,
            kind,
            refresh,
        } => commands::summary::source(&core, source, kind, refresh).await,
        Commands::Digest { refresh } => commands::summary::digest(&core, refresh).await,
        Commands::Overview { filter } => commands::summary::overview(&core, filter).await,
        Commands::Sync { sources, full } => commands::sync::run(&core, sources, full).await,
        Commands::Status => commands::status::run(&core).await,
        Commands::Connect { source, token } => commands::connect::connect(&core, source, &token),
        Commands::Disconnect { source } => commands::connect::disconnect(&core, source).await,
    };

    // Background refreshes and syncs finish before the process exits.
    core.shutdown().await;
    outcome
}
