//! # newswatch CLI
//!
//! ## Usage
//!
//! ```bash
//! newswatch --config ./config/newswatch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `newswatch init` | Create the article table and batch ledger |
//! | `newswatch ingest "<name>"` | Search for news on an individual and write a batch file |
//! | `newswatch load "<name>"` | Load new batch files for an individual |
//! | `newswatch watermark "<name>"` | Show the current load watermark |
//! | `newswatch invoke --event <file>` | Run a stage from a JSON event payload |
//! | `newswatch serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! newswatch ingest "Senzo Mchunu" --keyword fraud --keyword bribery
//! newswatch load "Senzo Mchunu"
//! newswatch load "Senzo Mchunu" --full --dry-run
//! newswatch invoke --event ./s3-notification.json
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;

use newswatch::batch_store;
use newswatch::config::{self, Config};
use newswatch::db;
use newswatch::invoke::{self, Invocation};
use newswatch::loader::{run_load, LoadOptions, LoadReport};
use newswatch::logging;
use newswatch::migrate;
use newswatch::search::{run_ingest, IngestRequest, TavilyProvider};
use newswatch::server;
use newswatch::watermark::WatermarkResolver;

/// newswatch: search news for named individuals and load the results
/// incrementally into an article table.
#[derive(Parser)]
#[command(name = "newswatch", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/newswatch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the article table and batch ledger. Idempotent.
    Init,

    /// Search for news mentioning an individual and write one batch file.
    Ingest {
        /// Individual's name, e.g. "Senzo Mchunu".
        name: String,

        /// Search keyword; repeat for several. Defaults to `[search] keywords`.
        #[arg(long = "keyword")]
        keywords: Vec<String>,

        /// Domain to restrict results to; repeat for several.
        #[arg(long = "domain")]
        domains: Vec<String>,
    },

    /// Load batch files newer than the individual's watermark.
    Load {
        /// Individual's name, exactly as stored in the mention sets.
        name: String,

        /// Ignore the watermark and ledger and reload the whole history.
        #[arg(long)]
        full: bool,

        /// List the batch files that would be loaded without loading them.
        #[arg(long)]
        dry_run: bool,

        /// Stop after this many files.
        #[arg(long)]
        limit: Option<usize>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the load watermark for an individual.
    Watermark { name: String },

    /// Run a stage from a JSON event file and print the invocation response.
    Invoke {
        /// Path to the event JSON (direct, EventBridge, or S3 notification).
        #[arg(long)]
        event: PathBuf,

        #[arg(long, value_enum, default_value = "load")]
        stage: Stage,
    },

    /// Start the HTTP server on `[server] bind`.
    Serve,
}

#[derive(Clone, Copy, ValueEnum)]
enum Stage {
    Load,
    Ingest,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            name,
            keywords,
            domains,
        } => {
            run_ingest_command(&cfg, name, keywords, domains).await?;
        }
        Commands::Load {
            name,
            full,
            dry_run,
            limit,
            json,
        } => {
            let store = batch_store::from_config(&cfg.store)?;
            let options = LoadOptions {
                full,
                dry_run,
                limit,
            };
            let report = run_load(&cfg, store.as_ref(), &name, &options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report, dry_run);
            }
        }
        Commands::Watermark { name } => {
            let pool = db::connect(&cfg).await?;
            migrate::ensure_schema(&pool, &cfg.table.name).await?;
            let watermark = WatermarkResolver::new(&pool, &cfg.table.name)
                .resolve(&name)
                .await;
            pool.close().await;
            println!("{}", watermark?);
        }
        Commands::Invoke { event, stage } => {
            let raw = std::fs::read_to_string(&event)?;
            let event: Value = serde_json::from_str(&raw)?;
            let response: Invocation = match stage {
                Stage::Load => invoke::invoke_load(&cfg, &event).await,
                Stage::Ingest => invoke::invoke_ingest(&cfg, &event).await,
            };
            println!("{}", serde_json::to_string_pretty(&response)?);
            if response.status_code != 200 {
                std::process::exit(1);
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

async fn run_ingest_command(
    cfg: &Config,
    name: String,
    keywords: Vec<String>,
    domains: Vec<String>,
) -> anyhow::Result<()> {
    let request = IngestRequest {
        individual: name,
        keywords: if keywords.is_empty() {
            cfg.search.keywords.clone()
        } else {
            keywords
        },
        include_domains: if domains.is_empty() {
            cfg.search.include_domains.clone()
        } else {
            domains
        },
    };

    let provider = TavilyProvider::from_config(&cfg.search)?;
    let store = batch_store::from_config(&cfg.store)?;
    let outcome = run_ingest(cfg, store.as_ref(), &provider, &request, chrono::Utc::now()).await?;

    println!("ingest {}", request.individual);
    println!("  query: {}", outcome.query);
    println!("  results: {}", outcome.processed_count);
    match outcome.key {
        Some(key) => println!("  written: {}", key),
        None => println!("  written: nothing"),
    }
    println!("ok");
    Ok(())
}

fn print_report(report: &LoadReport, dry_run: bool) {
    if dry_run {
        println!("load {} (dry-run)", report.individual);
    } else {
        println!("load {}", report.individual);
    }
    println!("  watermark: {}", report.watermark);
    println!("  listed after: {}", report.boundary);
    if dry_run {
        println!("  pending files: {}", report.pending_keys.len());
        for key in &report.pending_keys {
            println!("    {}", key);
        }
    } else {
        println!("  processed files: {}", report.processed_files);
        println!("  failed files: {}", report.failed_files);
    }
    println!("  already loaded: {}", report.skipped_files);
    if !dry_run {
        println!("  records merged: {}", report.records_merged());
        println!("  records skipped: {}", report.records_skipped);
        for failure in &report.failures {
            println!("  failed: {} ({})", failure.key, failure.error);
        }
    }
    println!("ok");
}
