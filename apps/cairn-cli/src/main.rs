//! Command-line harness for the batch/transaction processor.
//!
//! This binary is the smallest possible driver that exercises the full
//! pipeline without the out-of-scope HTTP layer: it loads a `Bundle` JSON
//! document, runs it through an in-process `Processor` backed by
//! `InMemoryResourceStore`, and prints the response `Bundle` as JSON.

mod config;
mod logging;

use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cairn_models::bundle::Bundle;
use cairn_store::{InMemoryResourceStore, LuidGenerator, WorkerPool};
use cairn_txn::{NaiveSearchOracle, PreferReturn, Processor};
use clap::{Parser, Subcommand, ValueEnum};

use config::Settings;

#[derive(Parser)]
#[command(name = "cairn", about = "FHIR batch/transaction bundle processor", version, arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a `batch` or `transaction` Bundle through the processor and print
    /// the response Bundle.
    Submit {
        /// Path to a Bundle JSON document, or "-" to read from stdin.
        #[arg(short, long, default_value = "-")]
        input: String,
        /// Write the response Bundle to a file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Pretty-print the response Bundle JSON.
        #[arg(long, default_value_t = true)]
        pretty: bool,
        /// `Prefer: return=` behavior for write entries.
        #[arg(long, value_enum, default_value = "representation")]
        prefer: Prefer,
        /// Override the configured base URL used for `location`/`fullUrl` values.
        #[arg(long)]
        base_url: Option<String>,
        /// Seed for the LUID generator used to assign ids to created resources.
        #[arg(long, default_value_t = 0)]
        luid_seed: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Prefer {
    Minimal,
    Representation,
}

impl From<Prefer> for PreferReturn {
    fn from(value: Prefer) -> Self {
        match value {
            Prefer::Minimal => PreferReturn::Minimal,
            Prefer::Representation => PreferReturn::Representation,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load().context("failed to load configuration")?;
    logging::init_logging(&settings.logging);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting cairn");

    match cli.command {
        Commands::Submit { input, output, pretty, prefer, base_url, luid_seed } => {
            submit(&settings, input, output, pretty, prefer.into(), base_url, luid_seed).await
        }
    }
}

async fn submit(
    settings: &Settings,
    input: String,
    output: Option<PathBuf>,
    pretty: bool,
    prefer: PreferReturn,
    base_url_override: Option<String>,
    luid_seed: u64,
) -> anyhow::Result<()> {
    let raw = read_input(&input).with_context(|| format!("failed to read bundle from \"{input}\""))?;
    let bundle: Bundle = serde_json::from_str(&raw).context("failed to parse bundle JSON")?;

    let base_url = base_url_override.unwrap_or_else(|| settings.store.base_url.clone());

    let store = Arc::new(InMemoryResourceStore::new());
    let oracle = Arc::new(NaiveSearchOracle::new(store.clone()));
    let luids = Arc::new(LuidGenerator::new(luid_seed));
    let pool = Arc::new(WorkerPool::new(
        settings.store.pool_width,
        settings.store.pool_queue_depth,
        Duration::from_secs(settings.store.pool_timeout_seconds),
    ));

    let processor = Processor::new(store, oracle, luids, pool, base_url);

    tracing::info!(bundle_type = ?bundle.type_, entry_count = bundle.entries().len(), "Processing bundle");

    let response = processor
        .process(&bundle, prefer)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let rendered = if pretty {
        serde_json::to_string_pretty(&response)?
    } else {
        serde_json::to_string(&response)?
    };

    write_json_output(&rendered, output.as_deref())?;

    Ok(())
}

fn read_input(path: &str) -> anyhow::Result<String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(std::fs::read_to_string(path)?)
    }
}

fn write_json_output(rendered: &str, output: Option<&std::path::Path>) -> anyhow::Result<()> {
    match output {
        Some(path) => std::fs::write(path, rendered).with_context(|| format!("failed to write output to \"{}\"", path.display())),
        None => {
            println!("{rendered}");
            Ok(())
        }
    }
}
