//! LedgerWatch CLI - Main entry point

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ledgerwatch_cli::{commands, AppContext};
use ledgerwatch_core::PRIORITY_HIGH;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ledgerwatch")]
#[command(about = "LedgerWatch - financial audit and anomaly detection", long_about = None)]
struct Cli {
    /// SQLite database path
    #[arg(short, long, env = "LEDGERWATCH_DB", default_value = "./data/ledgerwatch.db")]
    db: PathBuf,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// User ids notified about new anomalies
    #[arg(long, env = "LEDGERWATCH_AUDITORS", value_delimiter = ',')]
    auditors: Vec<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the audit schema
    Init,

    /// Run a periodic scheduling sweep
    Schedule,

    /// Process queued audit jobs
    Work {
        /// Drain due jobs once and exit
        #[arg(long)]
        once: bool,
    },

    /// Run the global audit now
    Global,

    /// Show audit statistics
    Stats,

    /// List the most recent audit logs
    Recent {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show the audit history of a wallet
    History {
        wallet: i64,
    },

    /// Queue a targeted audit for a wallet
    Enqueue {
        wallet: i64,
        /// 1 is the highest priority
        #[arg(long, default_value_t = PRIORITY_HIGH)]
        priority: u8,
    },

    /// List jobs that exhausted their attempts
    Failed,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let ctx = AppContext::open(&cli.db, cli.config.as_deref(), &cli.auditors)?;

    match cli.command {
        Commands::Init => commands::init(&ctx)?,
        Commands::Schedule => commands::schedule(&ctx)?,
        Commands::Work { once } => commands::work(&ctx, once).await?,
        Commands::Global => commands::global(&ctx)?,
        Commands::Stats => commands::stats(&ctx)?,
        Commands::Recent { limit } => commands::recent(&ctx, limit)?,
        Commands::History { wallet } => commands::history(&ctx, wallet)?,
        Commands::Enqueue { wallet, priority } => commands::enqueue(&ctx, wallet, priority)?,
        Commands::Failed => commands::failed(&ctx)?,
    }

    Ok(())
}
