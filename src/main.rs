//! cdc2sql - change-event sink runner
//!
//! Reads newline-delimited JSON change events from a file or stdin and
//! commits them into a destination table in batches.

use anyhow::{Context, Result};
use cdc2sql::core::{DestinationKind, SinkConfig};
use cdc2sql::runner::{self, RunSummary};
use cdc2sql::sink::SinkHandler;
use clap::Parser;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "cdc2sql",
    about = "Batched transactional sink for change-data-capture events",
    version = "0.1.0"
)]
struct Args {
    /// File with one JSON change event per line; stdin when omitted
    input: Option<PathBuf>,

    /// Events handed to the sink per delivery
    #[arg(long, default_value = "500")]
    delivery_size: NonZeroUsize,

    /// Rows per transaction (overrides the *_INSERT_BATCH_SIZE variable)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Destination adapter (overrides SINK_DESTINATION)
    #[arg(long)]
    destination: Option<DestinationKind>,

    /// Destination table (overrides SINK_TABLE_NAME)
    #[arg(long)]
    table: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(io::stderr);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = build_config(&args)?;
    info!(
        "Sink configuration: destination={}, table={}, batch_size={}",
        config.destination, config.table_name, config.batch_size
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, finishing the current delivery");
            signal_flag.store(true, Ordering::SeqCst);
        }
    });

    match run_sink(config, args.input, args.delivery_size, shutdown).await {
        Ok(summary) => {
            info!(
                "Sink completed: {} deliveries, {} events",
                summary.deliveries, summary.events
            );
            Ok(())
        }
        Err(e) => {
            error!("Sink failed: {:#}", e);
            Err(e)
        }
    }
}

fn build_config(args: &Args) -> Result<SinkConfig> {
    let mut config = SinkConfig::from_env().context("Failed to load configuration")?;

    if let Some(destination) = &args.destination {
        config = config.with_destination(destination.clone());
    }
    if let Some(batch_size) = args.batch_size {
        config = config.with_batch_size(batch_size);
    }
    if let Some(table) = &args.table {
        config = config.with_table_name(table.clone());
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run_sink(
    config: SinkConfig,
    input: Option<PathBuf>,
    delivery_size: NonZeroUsize,
    shutdown: Arc<AtomicBool>,
) -> Result<RunSummary> {
    // libpq is synchronous and the SQL Server session blocks on the runtime,
    // so the whole handler lives on a blocking thread
    let summary = tokio::task::spawn_blocking(move || -> Result<RunSummary> {
        let reader: Box<dyn BufRead> = match &input {
            Some(path) => Box::new(BufReader::new(
                File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
            )),
            None => Box::new(BufReader::new(io::stdin())),
        };

        let mut handler = SinkHandler::open(&config)?;
        let summary = runner::run(&mut handler, reader, delivery_size, &shutdown)?;
        Ok(summary)
    })
    .await??;

    Ok(summary)
}
