//! # feedrag CLI
//!
//! ## Usage
//!
//! ```bash
//! feedrag --config ./config/feedrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `feedrag init` | Create the SQLite database and run schema migrations |
//! | `feedrag listen` | Follow the change feed until ctrl-c |
//! | `feedrag serve` | Start the HTTP API with the listener in the background |
//! | `feedrag query "<text>"` | Search indexed chunks |
//! | `feedrag reingest` | Rebuild the index from every document in the database |
//! | `feedrag cursor show` | Print the stored change-feed position |
//! | `feedrag cursor reset` | Forget the stored position |

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use feedrag::{config, cursor, index, listener, migrate, search, server};

/// feedrag: a retrieval-augmented chat backend fed by a CouchDB change feed.
#[derive(Parser)]
#[command(name = "feedrag", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/feedrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Follow the change feed and keep the index current.
    Listen,

    /// Start the HTTP API; the listener runs alongside it.
    Serve,

    /// Search indexed chunks.
    Query {
        /// Free-text query.
        query: String,

        /// Maximum number of hits.
        #[arg(long)]
        limit: Option<i64>,

        /// Minimum similarity in [0, 1].
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Wipe the index and ingest every document from `_all_docs`.
    Reingest,

    /// Inspect or reset the change-feed cursor.
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
    },
}

#[derive(Subcommand)]
enum CursorAction {
    /// Print the stored sequence token.
    Show,
    /// Delete the stored sequence token; the next run starts from the feed head.
    Reset,
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.log.level)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Listen => {
            listener::run_listen(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Query {
            query,
            limit,
            threshold,
        } => {
            search::run_query(&cfg, &query, limit, threshold).await?;
        }
        Commands::Reingest => {
            index::run_reingest(&cfg).await?;
        }
        Commands::Cursor { action } => match action {
            CursorAction::Show => cursor::run_cursor_show(&cfg).await?,
            CursorAction::Reset => cursor::run_cursor_reset(&cfg).await?,
        },
    }

    Ok(())
}
