//! # kb-harness CLI (`kbh`)
//!
//! Builds, inspects, and queries the knowledge-base pipeline.
//!
//! ## Usage
//!
//! ```bash
//! kbh --config ./config/kbh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbh fingerprint` | Print the current corpus fingerprint |
//! | `kbh status` | Corpus and on-disk cache state |
//! | `kbh warmup [--force]` | Build or load the pipeline and persist caches |
//! | `kbh search "<query>"` | Show the chunks retrieval would use |
//! | `kbh query "<prompt>"` | Retrieval-augmented answer |
//! | `kbh generate --payload ast.json` | Generate unit tests for a class AST |
//! | `kbh clear-cache` | Delete persisted chunks and index |
//! | `kbh serve` | Start the HTTP server |
//!
//! Logging is controlled by `RUST_LOG` (default `info`) and written to
//! stderr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use kb_harness::commands::{self, PipelineArgs};
use kb_harness::{config, server};

/// kb-harness: cached retrieval-augmented generation over a text corpus.
#[derive(Parser)]
#[command(name = "kbh", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Retrieval options shared by commands that query the pipeline.
#[derive(clap::Args, Debug, Clone)]
struct RetrievalArgs {
    /// Number of chunks to retrieve (defaults to `[retrieval].k`).
    #[arg(long)]
    k: Option<usize>,

    /// Search mode: `similarity`, `mmr`, or `similarity_score_threshold`.
    #[arg(long)]
    mode: Option<String>,

    /// Rebuild chunks and index even if the corpus is unchanged.
    #[arg(long)]
    force: bool,
}

impl From<RetrievalArgs> for PipelineArgs {
    fn from(args: RetrievalArgs) -> Self {
        PipelineArgs {
            k: args.k,
            mode: args.mode,
            force: args.force,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current corpus fingerprint.
    Fingerprint,

    /// Show corpus and cache state without building anything.
    Status,

    /// Build or load the pipeline so later runs start warm.
    Warmup {
        /// Re-split and re-embed even if the caches are fresh.
        #[arg(long)]
        force: bool,
    },

    /// Retrieve the chunks most relevant to a query.
    Search {
        query: String,
        #[command(flatten)]
        retrieval: RetrievalArgs,
    },

    /// Answer a prompt with retrieved context.
    Query {
        prompt: String,
        #[command(flatten)]
        retrieval: RetrievalArgs,
    },

    /// Generate unit tests for a class described by an AST JSON file.
    Generate {
        /// Path to the AST JSON payload, or `-` for stdin.
        #[arg(long)]
        payload: PathBuf,
        #[command(flatten)]
        retrieval: RetrievalArgs,
    },

    /// Delete the persisted chunk record and index.
    ClearCache,

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Fingerprint => commands::run_fingerprint(&cfg)?,
        Commands::Status => commands::run_status(&cfg).await?,
        Commands::Warmup { force } => commands::run_warmup(&cfg, force).await?,
        Commands::Search { query, retrieval } => {
            commands::run_search(&cfg, &query, &retrieval.into()).await?
        }
        Commands::Query { prompt, retrieval } => {
            commands::run_query(&cfg, &prompt, &retrieval.into()).await?
        }
        Commands::Generate { payload, retrieval } => {
            commands::run_generate(&cfg, &payload, &retrieval.into()).await?
        }
        Commands::ClearCache => commands::run_clear_cache(&cfg).await?,
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}
