//! # Dossier CLI (`dossier`)
//!
//! ## Usage
//!
//! ```bash
//! dossier --config ./config/dossier.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dossier init` | Create the SQLite database and storage root |
//! | `dossier ingest <pdf>` | Register a PDF and copy it into storage |
//! | `dossier analyze <id> [--wait]` | Create units, chunk/upload if needed, optionally run to completion |
//! | `dossier step <id>` | Run a single driver step |
//! | `dossier status <id>` | Show document and unit status |
//! | `dossier attempts <id>` | Show the model attempt ledger |
//! | `dossier validate <file> --stage <title>` | Check a JSON report against a stage schema |
//! | `dossier monitor [--once]` | Scan for stuck units |
//! | `dossier serve` | Start the HTTP API with dispatcher workers |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use dossier_pipeline::{commands, config, server};

/// Dossier: multi-stage LLM analysis of legal-process PDFs.
#[derive(Parser)]
#[command(
    name = "dossier",
    about = "Dossier: chunked, validated, multi-model analysis of legal-process PDFs",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dossier.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and storage root. Idempotent.
    Init,

    /// Register a PDF document.
    ///
    /// Identical files are detected by content hash and map to the
    /// already-registered document.
    Ingest {
        /// Path to the PDF.
        path: PathBuf,
    },

    /// Start analysis of a registered document.
    Analyze {
        /// Document ID.
        id: String,

        /// Run the dispatcher until the document stops making progress.
        #[arg(long)]
        wait: bool,
    },

    /// Run one driver step: claim, execute and persist the next unit.
    Step {
        /// Document ID.
        id: String,
    },

    /// Show document and unit status.
    Status {
        /// Document ID.
        id: String,
    },

    /// List recorded model attempts for a document.
    Attempts {
        /// Document ID.
        id: String,
    },

    /// Validate a JSON report against a stage's schema.
    Validate {
        /// Path to the JSON file.
        file: PathBuf,

        /// Stage title (or identifier) whose schema applies.
        #[arg(long)]
        stage: String,
    },

    /// Detect units stuck in processing and alert.
    Monitor {
        /// Run one scan and exit.
        #[arg(long)]
        once: bool,
    },

    /// Start the HTTP API, dispatcher workers and stuck-unit monitor.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            commands::run_init(&cfg).await?;
        }
        Commands::Ingest { path } => {
            commands::run_ingest(&cfg, &path).await?;
        }
        Commands::Analyze { id, wait } => {
            commands::run_analyze(&cfg, &id, wait).await?;
        }
        Commands::Step { id } => {
            commands::run_step(&cfg, &id).await?;
        }
        Commands::Status { id } => {
            commands::run_status(&cfg, &id).await?;
        }
        Commands::Attempts { id } => {
            commands::run_attempts(&cfg, &id).await?;
        }
        Commands::Validate { file, stage } => {
            commands::run_validate(&cfg, &file, &stage)?;
        }
        Commands::Monitor { once } => {
            commands::run_monitor(&cfg, once).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
