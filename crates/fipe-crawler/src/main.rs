// Copyright 2026 FIPE Crawler Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fipe_crawler::frontier::Frontier;
use fipe_crawler::hierarchy::Level;
use fipe_crawler::recorder::ObservationRecorder;
use fipe_crawler::source::chromium::{BrowserSettings, ChromiumFactory};
use fipe_crawler::source::scripted::{Catalog, ScriptedFactory};
use fipe_crawler::source::SourceFactory;
use fipe_crawler::{CrawlConfig, CrawlError, Database, RunSummary, TraversalEngine};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tracing::{error, warn};

/// Exit status of an interrupted crawl.
const EXIT_INTERRUPTED: i32 = 2;

#[derive(Parser)]
#[command(
    name = "fipe-crawler",
    about = "Resumable crawler for the FIPE vehicle price table",
    version,
    after_help = "Configuration is read from FIPE_* environment variables; flags override them."
)]
struct Cli {
    /// Store connection string (overrides FIPE_DATABASE_URL)
    #[arg(long, global = true)]
    database: Option<String>,

    /// Output results as JSON (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the live consultation page (default)
    Run {
        /// Consecutive faults on one node before giving up (0 = never)
        #[arg(long)]
        max_consecutive_faults: Option<u32>,
    },
    /// Show frontier and observation counts
    Status,
    /// Crawl a JSON catalog instead of the live page
    Simulate {
        /// Catalog fixture (periods → brands → models → years)
        fixture: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let json = cli.json;
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "error": true, "message": format!("{e:#}") })
                );
            }
            1
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let directive = if verbose {
        "fipe_crawler=debug"
    } else {
        "fipe_crawler=info"
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match directive.parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let mut config = CrawlConfig::from_env();
    let database = cli.database.clone();
    if let Some(url) = &database {
        config.database_url = url.clone();
    }

    match cli.command.unwrap_or(Commands::Run {
        max_consecutive_faults: None,
    }) {
        Commands::Run {
            max_consecutive_faults,
        } => {
            if let Some(max) = max_consecutive_faults {
                config.max_consecutive_faults = max;
            }
            let factory = ChromiumFactory::new(BrowserSettings {
                chromium_path: config.chromium_path.clone(),
                base_url: config.base_url.clone(),
                timeout: config.interaction_timeout,
            });
            crawl(&config, Box::new(factory), cli.json).await
        }
        Commands::Status => {
            status(&config, cli.json)?;
            Ok(0)
        }
        Commands::Simulate { fixture } => {
            // Simulations stay in memory unless a store is named explicitly.
            if database.is_none() {
                config.database_url = "sqlite::memory:".to_string();
            }
            let config = config.without_delays();
            let factory = ScriptedFactory::new(load_catalog(&fixture)?);
            crawl(&config, Box::new(factory), cli.json).await
        }
    }
}

fn load_catalog(path: &Path) -> Result<Catalog> {
    Catalog::load(path).with_context(|| format!("failed to load catalog {}", path.display()))
}

fn open_store(config: &CrawlConfig) -> Result<Database> {
    Database::open(&config.database_url, config.write_retry)
        .with_context(|| format!("failed to open store {}", config.database_url))
}

async fn crawl(config: &CrawlConfig, factory: Box<dyn SourceFactory>, json: bool) -> Result<i32> {
    let db = open_store(config)?;
    // Store retries block the runtime thread; the flag is set from a
    // separate task so they stop between attempts.
    let interrupt = db.interrupt_handle();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.store(true, Ordering::SeqCst);
        }
    });
    let mut engine = TraversalEngine::new(db, factory, config);

    let outcome = tokio::select! {
        result = engine.run() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    watcher.abort();
    let result = match outcome {
        Some(Err(CrawlError::Interrupted)) | None => {
            warn!("interrupted; releasing automation session");
            engine.shutdown().await;
            return Ok(EXIT_INTERRUPTED);
        }
        Some(result) => result,
    };

    let summary = result.context("crawl failed")?;
    let observations = ObservationRecorder::new(engine.database()).count()?;
    print_summary(engine.run_id(), &summary, observations, json);
    Ok(0)
}

fn print_summary(run_id: &str, summary: &RunSummary, observations: u64, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "run_id": run_id,
                "summary": summary,
                "observations": observations
            })
        );
        return;
    }
    println!("  Crawl {run_id} complete in {}ms", summary.elapsed_ms);
    println!("    new observations   {}", summary.observations_written);
    println!("    absent leaves      {}", summary.leaves_absent);
    println!("    faults / resets    {} / {}", summary.faults, summary.resets);
    println!("    total observations {observations}");
}

fn status(config: &CrawlConfig, json: bool) -> Result<()> {
    let db = open_store(config)?;
    let frontier = Frontier::new(&db);
    let mut levels = Vec::new();
    for level in Level::ALL {
        levels.push((level, frontier.counts(level)?));
    }
    let observations = ObservationRecorder::new(&db).count()?;

    if json {
        let levels: serde_json::Map<String, serde_json::Value> = levels
            .iter()
            .map(|(level, counts)| (level.to_string(), serde_json::json!(counts)))
            .collect();
        println!(
            "{}",
            serde_json::json!({ "levels": levels, "observations": observations })
        );
        return Ok(());
    }

    println!("  Store: {}", config.database_url);
    println!(
        "  {:<12} {:>10} {:>10} {:>10}",
        "level", "unvisited", "visiting", "visited"
    );
    for (level, counts) in &levels {
        println!(
            "  {:<12} {:>10} {:>10} {:>10}",
            level.to_string(),
            counts.unvisited,
            counts.visiting,
            counts.visited
        );
    }
    println!("  observations {observations}");
    Ok(())
}
