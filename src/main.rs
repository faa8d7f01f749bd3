//! # docchat CLI
//!
//! ## Usage
//!
//! ```bash
//! docchat --config ./config/docchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat init` | Create the SQLite database and run schema migrations |
//! | `docchat serve` | Start the HTTP server |
//! | `docchat ingest <file> --owner <id>` | Upload and ingest a document, then print its status |
//! | `docchat status <document_id> --owner <id>` | Print a document's processing status |
//! | `docchat ask <chat_id> "<message>" --owner <id>` | Ask a question, optionally about one document |
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`
//! (default `docchat=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docchat::{cli, config, migrate, server};

/// docchat: ask questions about uploaded documents, with citations.
#[derive(Parser)]
#[command(
    name = "docchat",
    about = "docchat: document question answering over a retrieval pipeline",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables.
    /// Running it multiple times is safe.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Upload a file and run ingestion to completion.
    Ingest {
        /// Document to ingest (PDF, DOCX, PPTX, Markdown or plain text).
        file: PathBuf,

        /// Owner id recorded on the document.
        #[arg(long)]
        owner: String,

        /// Override the content type derived from the file extension.
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Show a document's processing status.
    Status {
        document_id: String,

        #[arg(long)]
        owner: String,
    },

    /// Ask a question in a chat session.
    Ask {
        chat_id: String,

        message: String,

        #[arg(long)]
        owner: String,

        /// Ground the answer in this document.
        #[arg(long)]
        document: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docchat=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest {
            file,
            owner,
            content_type,
        } => {
            cli::run_ingest(&cfg, &file, &owner, content_type.as_deref()).await?;
        }
        Commands::Status { document_id, owner } => {
            cli::run_status(&cfg, &document_id, &owner).await?;
        }
        Commands::Ask {
            chat_id,
            message,
            owner,
            document,
        } => {
            cli::run_ask(&cfg, &chat_id, &message, &owner, document.as_deref()).await?;
        }
    }

    Ok(())
}
