//! Command-line interface for warehouse-sink
//!
//! ```bash
//! RUST_LOG=info warehouse-sink --config sink.toml kafka --timeout 10m
//! warehouse-sink replay changes.jsonl --chunk-size 500 --dry-run
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sink_buffer::{MemoryTarget, TargetDatabase};
use tracing::info;
use warehouse_sink::config::parse_duration;
use warehouse_sink::{kafka, replay, AppConfig, Sink};
use warehouse_sink_postgresql::PostgresTarget;

#[derive(Parser)]
#[command(name = "warehouse-sink")]
#[command(about = "Stream change records into a PostgreSQL / Greenplum warehouse")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(
        long,
        global = true,
        env = "WAREHOUSE_SINK_CONFIG",
        default_value = "warehouse-sink.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume change records from Kafka topics
    Kafka {
        /// Kafka brokers, overriding `kafka.brokers`
        #[arg(long, env = "KAFKA_BROKERS")]
        brokers: Option<String>,

        /// Topics to consume (comma-separated), overriding `kafka.topics`
        #[arg(long, value_delimiter = ',')]
        topics: Vec<String>,

        /// Consumer group, overriding `kafka.group_id`
        #[arg(long)]
        group_id: Option<String>,

        /// Stop after this long (e.g. "30s", "10m", "1h"); runs until Ctrl-C otherwise
        #[arg(long, value_parser = parse_duration)]
        timeout: Option<Duration>,

        /// Longest wait for records before a write cycle runs anyway (e.g. "500ms", "5s")
        #[arg(long, value_parser = parse_duration)]
        cycle_interval: Option<Duration>,

        /// Log statements against an in-memory target instead of the database
        #[arg(long)]
        dry_run: bool,
    },
    /// Replay change records from JSONL files
    Replay {
        /// JSONL files; bare values go to a topic named after the file
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Records handed to each write cycle
        #[arg(long, default_value = "1000")]
        chunk_size: usize,

        /// Log statements against an in-memory target instead of the database
        #[arg(long)]
        dry_run: bool,
    },
    /// Parse and validate the configuration file, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;

    match cli.command {
        Commands::Kafka {
            brokers,
            topics,
            group_id,
            timeout,
            cycle_interval,
            dry_run,
        } => {
            if let Some(brokers) = brokers {
                config.kafka.brokers = brokers;
            }
            if !topics.is_empty() {
                config.kafka.topics = topics;
            }
            if let Some(group_id) = group_id {
                config.kafka.group_id = group_id;
            }
            if let Some(interval) = cycle_interval {
                config.kafka.poll_timeout_ms = interval.as_millis() as u64;
            }
            config
                .kafka
                .validate()
                .context("Invalid Kafka configuration")?;

            let sink = build_sink(config.clone(), dry_run)?;
            info!(
                "Consuming {:?} from {} in {} mode",
                config.kafka.topics, config.kafka.brokers, config.sink.writer.load_mode
            );
            kafka::run(config.kafka, sink, timeout).await?;
        }
        Commands::Replay {
            paths,
            chunk_size,
            dry_run,
        } => {
            let mut sink = build_sink(config, dry_run)?;
            let total = replay::replay_files(&mut sink, &paths, chunk_size).await?;
            let stats = sink.stats();
            info!(
                "Replayed {total} records from {} files in {} cycles ({} rows flushed)",
                paths.len(),
                stats.cycles,
                stats.flushed_rows
            );
        }
        Commands::CheckConfig => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{rendered}");
            info!("Configuration {:?} is valid", cli.config);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        AppConfig::from_file(path)
    } else {
        info!("No configuration file at {path:?}, using defaults");
        Ok(AppConfig::default())
    }
}

fn build_sink(mut config: AppConfig, dry_run: bool) -> anyhow::Result<Sink> {
    let target: Arc<dyn TargetDatabase> = if dry_run {
        // Nothing exists in the in-memory target, so every table is created
        // from the first record that reaches it.
        config.sink.writer.auto_create = true;
        config.sink.writer.auto_evolve = true;
        info!("Dry run: statements are logged, nothing is written");
        Arc::new(MemoryTarget::new().with_statement_logging())
    } else {
        Arc::new(PostgresTarget::new(config.sink.connection.url.clone()))
    };
    Sink::new(config.sink, target).context("Failed to create the sink")
}
