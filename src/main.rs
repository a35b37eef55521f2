//! # kbase CLI (`kb`)
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb ingest <paths…>` | Ingest files and directories |
//! | `kb query "<text>"` | Semantic search over stored chunks |
//! | `kb remove <id>` | Remove a document and its vectors |
//! | `kb list` | List stored documents |
//! | `kb show <id>` | Show a document's metadata, preview and chunks |
//! | `kb compact` | Reclaim index space left by removals |
//! | `kb stats` | Store statistics |
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`
//! (default `kbase=info`).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use kbase::commands;
use kbase::config;
use kbase::progress::ProgressMode;

/// kbase: a local knowledge base with semantic search.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "kbase: ingest documents in mixed encodings and query them semantically",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` when stderr is a
    /// terminal, otherwise `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest files or directories.
    ///
    /// Directories are walked recursively and filtered by the
    /// `[ingest]` include/exclude globs. Re-ingesting a path replaces the
    /// stored version of that document.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Search stored chunks by meaning.
    Query {
        text: String,

        /// Number of results.
        #[arg(short, long, default_value_t = 5)]
        k: usize,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Remove a document by id.
    Remove { id: String },

    /// List stored documents.
    List,

    /// Show a document's metadata, text preview and chunk ranges.
    Show {
        id: String,

        /// Characters of text to preview.
        #[arg(long, default_value_t = 500)]
        preview: usize,
    },

    /// Drop deleted entries from the index and retrain it.
    Compact,

    /// Print store statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kbase=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let progress = cli
        .progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Ingest { paths } => commands::run_ingest(&cfg, &paths, progress).await?,
        Commands::Query { text, k, json } => commands::run_query(&cfg, &text, k, json).await?,
        Commands::Remove { id } => commands::run_remove(&cfg, &id).await?,
        Commands::List => commands::run_list(&cfg).await?,
        Commands::Show { id, preview } => commands::run_show(&cfg, &id, preview).await?,
        Commands::Compact => commands::run_compact(&cfg).await?,
        Commands::Stats { json } => commands::run_stats(&cfg, json).await?,
    }

    Ok(())
}
