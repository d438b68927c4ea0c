//! CLI Entry Point for datalog
//!
//! Provides command-line interface for:
//! - Running the acquisition server (poll loop, in-memory store, TCP server)
//! - Querying, streaming and logging readings from a running server
//!
//! # Usage
//!
//! Start the server:
//! ```bash
//! datalog serve --config config/datalog.toml
//! ```
//!
//! Print the latest ten readings:
//! ```bash
//! datalog query --latest --amount 10
//! ```
//!
//! Follow new readings:
//! ```bash
//! datalog stream --subscribe
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use datalog::adc::{open_with_retry, AdcKind};
use datalog::clock::{Clock, SystemClock};
use datalog::config::Settings;
use datalog::data::{spawn_csv_logger, CsvLog, DataStore, ReadingQuery};
use datalog::fetch::Retriever;
use datalog::logging;
use datalog::network::{DataClient, DataServer};
use futures::{pin_mut, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "datalog")]
#[command(version, about = "PicoLog ADC-24 acquisition server and client", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = datalog::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire readings and serve them over TCP
    Serve,

    /// Print stored readings
    Query {
        #[command(flatten)]
        server: ServerArgs,

        /// Newest readings instead of oldest
        #[arg(long, conflicts_with_all = ["after", "before"])]
        latest: bool,

        /// Only readings after this time (ms since epoch)
        #[arg(long)]
        after: Option<i64>,

        /// Only readings at or before this time (ms since epoch)
        #[arg(long, conflicts_with = "after")]
        before: Option<i64>,

        /// Number of readings
        #[arg(long)]
        amount: Option<i64>,

        /// Comma-separated channel list
        #[arg(long, value_delimiter = ',')]
        channels: Vec<u8>,

        /// Print JSON instead of CSV
        #[arg(long)]
        json: bool,
    },

    /// Print new readings as they arrive
    Stream {
        #[command(flatten)]
        server: ServerArgs,

        /// Push readings instead of polling
        #[arg(long)]
        subscribe: bool,

        /// Start after this time (ms since epoch); defaults to now
        #[arg(long)]
        after: Option<i64>,

        /// Poll interval in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// Append new readings to a CSV file
    Log {
        #[command(flatten)]
        server: ServerArgs,

        /// Output file
        output: PathBuf,

        /// Poll interval in milliseconds
        #[arg(long, default_value = "10000")]
        interval_ms: u64,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Print server and unit information
    Info {
        #[command(flatten)]
        server: ServerArgs,
    },
}

#[derive(Args)]
struct ServerArgs {
    /// Server address; defaults to the configured host and port
    #[arg(long)]
    address: Option<String>,
}

impl ServerArgs {
    fn address(&self, settings: &Settings) -> String {
        self.address
            .clone()
            .unwrap_or_else(|| settings.server_address())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::Serve => serve(settings).await,
        Commands::Query {
            server,
            latest,
            after,
            before,
            amount,
            channels,
            json,
        } => {
            let mut query = ReadingQuery::new();
            if latest {
                query = query.latest();
            }
            if let Some(t) = after {
                query = query.after(t);
            }
            if let Some(t) = before {
                query = query.before(t);
            }
            query.amount = amount;
            if !channels.is_empty() {
                query = query.channels(channels);
            }
            run_query(&server.address(&settings), &query, json).await
        }
        Commands::Stream {
            server,
            subscribe,
            after,
            interval_ms,
        } => {
            stream(
                &server.address(&settings),
                subscribe,
                after,
                Duration::from_millis(interval_ms),
            )
            .await
        }
        Commands::Log {
            server,
            output,
            interval_ms,
        } => {
            log_to_file(
                &server.address(&settings),
                output,
                Duration::from_millis(interval_ms),
            )
            .await
        }
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
        Commands::Info { server } => show_info(&server.address(&settings)).await,
    }
}

async fn serve(settings: Settings) -> Result<()> {
    info!(name = %settings.application.name, "Starting acquisition server");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut adc = AdcKind::from_config(&settings.adc, clock)?;
    open_with_retry(
        adc.as_mut(),
        settings.adc.open_attempts,
        Duration::from_millis(settings.adc.reopen_delay_ms),
    )
    .await
    .context("opening ADC unit")?;

    let store = DataStore::new(settings.datastore.max_size).into_shared();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let csv_logger = match &settings.log_file {
        Some(path) => {
            let log = CsvLog::create(path)?;
            let readings = store.read().await.subscribe();
            Some(spawn_csv_logger(log, readings, shutdown_rx.clone()))
        }
        None => None,
    };

    let retriever = Retriever::new(
        adc,
        store.clone(),
        Duration::from_millis(settings.fetch.poll_time_ms),
    )
    .with_device(settings.device.clone())
    .spawn()
    .context("starting acquisition")?;

    let server = DataServer::bind(settings.server.clone(), store, retriever.status()).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
        })
        .await?;

    retriever.stop().await?;
    // Receivers may already be gone
    let _ = shutdown_tx.send(true);
    if let Some(logger) = csv_logger {
        let rows = logger.await??;
        info!(rows, "CSV log complete");
    }
    Ok(())
}

async fn run_query(address: &str, query: &ReadingQuery, json: bool) -> Result<()> {
    let mut client = DataClient::connect(address).await?;
    if json {
        let readings = client.readings(query).await?;
        println!("{}", serde_json::to_string_pretty(&readings)?);
    } else {
        let csv = client.readings_csv(query).await?;
        if !csv.is_empty() {
            println!("{}", csv);
        }
    }
    client.quit().await?;
    Ok(())
}

async fn stream(
    address: &str,
    subscribe: bool,
    after: Option<i64>,
    interval: Duration,
) -> Result<()> {
    let mut client = DataClient::connect(address).await?;
    if subscribe {
        let readings = client.subscribe(None).await?;
        pin_mut!(readings);
        while let Some(reading) = readings.next().await {
            println!("{}", reading?);
        }
    } else {
        let start = match after {
            Some(t) => t,
            None => client.timestamp().await?,
        };
        let readings = client.poll_stream(start, interval);
        pin_mut!(readings);
        while let Some(reading) = readings.next().await {
            println!("{}", reading?);
        }
    }
    Ok(())
}

async fn log_to_file(address: &str, output: PathBuf, interval: Duration) -> Result<()> {
    let mut client = DataClient::connect(address).await?;
    let start = client.timestamp().await?;
    let mut log = CsvLog::create(&output)?;

    let readings = client.poll_stream(start, interval);
    pin_mut!(readings);
    while let Some(reading) = readings.next().await {
        log.append(&[reading?])?;
    }
    Ok(())
}

async fn show_info(address: &str) -> Result<()> {
    let mut client = DataClient::connect(address).await?;
    let info = client.info().await?;
    println!("{}", info.to_csv());

    match client.enabled_channels().await {
        Ok(channels) => {
            println!("sample_time_ms,{}", client.sample_time().await?);
            for channel in channels {
                println!(
                    "volts_per_count_{},{}",
                    channel,
                    client.volts_conversion(channel).await?
                );
            }
        }
        Err(e) => warn!("Unit status unavailable: {}", e),
    }
    client.quit().await?;
    Ok(())
}
