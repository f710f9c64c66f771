//! # Receipt Rewards CLI (`rewards`)
//!
//! The `rewards` binary runs the receipt ingestion API and offers a few
//! read-only commands for inspecting the ledger.
//!
//! ## Usage
//!
//! ```bash
//! rewards --config ./config/rewards.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rewards init` | Create the SQLite database and schema |
//! | `rewards serve` | Start the HTTP API |
//! | `rewards receipts` | List processed receipts, newest first |
//! | `rewards points` | Print the current points balance |
//! | `rewards stats` | Summarize receipts, spend, and balance |
//!
//! The config file is optional. `OCR_SERVICE_URL` and `PORT` override the
//! recognition endpoint and listening port; a `.env` file is honored.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use receipt_rewards::{config, migrate, receipts, server, stats};

/// Receipt Rewards — turn receipt photos into reward points.
#[derive(Parser)]
#[command(
    name = "rewards",
    about = "Receipt Rewards — turn receipt photos into reward points",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/rewards.toml`. Built-in defaults are used when
    /// the file does not exist.
    #[arg(long, global = true, default_value = "./config/rewards.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the receipts and points_ledger
    /// tables. Safe to run repeatedly.
    Init,

    /// Start the HTTP API.
    ///
    /// Applies the schema, then serves `/api/receipts`, `/api/points`, and
    /// `/health` on the configured bind address.
    Serve,

    /// List processed receipts, newest first.
    Receipts {
        /// Maximum number of receipts to print.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print the current points balance.
    Points,

    /// Summarize receipts, spend, and balance.
    Stats,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "receipt_rewards=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let cfg = config::resolve_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Receipts { limit } => {
            receipts::run_list_receipts(&cfg, limit).await?;
        }
        Commands::Points => {
            receipts::run_points(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
