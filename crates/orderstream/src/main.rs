//! orderstream - order and payment stream engine
//!
//! # Usage
//!
//! ```bash
//! # Run the pipeline (default command)
//! orderstream -c orderstream.yaml
//!
//! # Override settings from the environment
//! KAFKA_BOOTSTRAP_SERVERS=localhost:9092 DATABASE_URL=postgres://... orderstream run
//!
//! # Validate configuration
//! orderstream -c orderstream.yaml validate
//!
//! # Check connectivity to broker and database
//! orderstream check
//!
//! # Show the committed checkpoint
//! orderstream checkpoint
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use orderstream::checkpoint::{CheckpointBackend, CheckpointManager, FileCheckpointStore};
use orderstream::config::{ConfigOverrides, OrderStreamConfig};
use orderstream::engine::StreamEngine;
use orderstream::metrics::{start_metrics_server, PipelineMetrics};
use orderstream::pipeline::{Pipeline, PipelineSettings};
use orderstream::sink::{RdbcSink, SinkWriter, StreamSink};
use orderstream::source::kafka::{KafkaReader, StartOffset};

const DEFAULT_CONFIG: &str = "orderstream.yaml";

#[derive(Parser)]
#[command(name = "orderstream")]
#[command(version, about = "Stream engine for e-commerce order and payment events")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "ORDERSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "ORDERSTREAM_LOG_FORMAT")]
    log_format: LogFormat,

    /// Kafka bootstrap servers, comma separated
    #[arg(long, env = "KAFKA_BOOTSTRAP_SERVERS", value_delimiter = ',')]
    brokers: Option<Vec<String>>,

    /// Topic to consume
    #[arg(long, env = "KAFKA_TOPIC")]
    topic: Option<String>,

    /// Where to start partitions without a checkpoint
    #[arg(long, value_enum, env = "ORDERSTREAM_START_OFFSET")]
    start_offset: Option<StartArg>,

    /// Sink connection URL
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    sink_url: Option<String>,

    /// Lateness allowance in seconds
    #[arg(long, env = "ORDERSTREAM_LATENESS_SECS")]
    lateness_secs: Option<u64>,

    /// Window size in seconds
    #[arg(long, env = "ORDERSTREAM_WINDOW_SECS")]
    window_secs: Option<u64>,

    /// Pause between empty polls in milliseconds
    #[arg(long, env = "ORDERSTREAM_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Maximum records per micro-batch
    #[arg(long, env = "ORDERSTREAM_MAX_BATCH_RECORDS")]
    max_batch_records: Option<usize>,

    /// Sink write retries per batch
    #[arg(long, env = "ORDERSTREAM_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Checkpoint directory
    #[arg(long, env = "ORDERSTREAM_CHECKPOINT_DIR")]
    checkpoint_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default)
    Run,
    /// Validate configuration and print a summary
    Validate,
    /// Check connectivity to the broker and the database
    Check,
    /// Show the committed checkpoint
    Checkpoint,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StartArg {
    Earliest,
    Latest,
}

impl From<StartArg> for StartOffset {
    fn from(arg: StartArg) -> Self {
        match arg {
            StartArg::Earliest => StartOffset::Earliest,
            StartArg::Latest => StartOffset::Latest,
        }
    }
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bootstrap_servers: self.brokers.clone(),
            topic: self.topic.clone(),
            start_offset: self.start_offset.map(StartOffset::from),
            sink_url: self.sink_url.clone(),
            lateness_secs: self.lateness_secs,
            window_secs: self.window_secs,
            poll_interval_ms: self.poll_interval_ms,
            max_batch_records: self.max_batch_records,
            max_retries: self.max_retries,
            checkpoint_dir: self.checkpoint_dir.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (path, explicit) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG), false),
    };
    let config = OrderStreamConfig::load(&path, explicit, &cli.overrides())
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    init_logging(&config.log_level, cli.verbose, cli.log_format);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_pipeline(config).await,
        Commands::Validate => validate_config(&config),
        Commands::Check => check_connectivity(&config).await,
        Commands::Checkpoint => show_checkpoint(&config).await,
    }
}

fn init_logging(level: &str, verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { level };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn run_pipeline(config: OrderStreamConfig) -> Result<()> {
    info!("Starting orderstream");
    info!(
        brokers = ?config.source.bootstrap_servers,
        topic = %config.source.topic,
        window_secs = config.engine.window_secs,
        lateness_secs = config.engine.lateness_secs,
        "Configuration loaded"
    );

    let metrics = Arc::new(PipelineMetrics::new());
    if config.metrics.enabled {
        let port = config.metrics.port;
        let served = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port, served).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let store = FileCheckpointStore::with_options(&config.checkpoint.dir, config.checkpoint.fsync)
        .await
        .context("Failed to open checkpoint directory")?;
    let checkpoints = CheckpointManager::new(Arc::new(store), config.source.topic.clone())
        .with_timeout(config.checkpoint.timeout());

    let sink = Arc::new(RdbcSink::postgres(config.sink.to_rdbc_config()));
    sink.ensure_schema()
        .await
        .context("Failed to prepare sink tables")?;
    let writer = SinkWriter::new(sink, config.sink.write_timeout(), config.retry.to_policy());

    let reader = KafkaReader::connect(config.source.to_reader_config())
        .await
        .context("Failed to connect to Kafka")?;

    let engine = StreamEngine::new(config.engine.to_engine_config());
    let mut pipeline = Pipeline::new(
        Box::new(reader),
        engine,
        writer,
        checkpoints,
        metrics,
        PipelineSettings::from(&config),
    );

    pipeline
        .recover()
        .await
        .context("Failed to recover from checkpoint")?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(4);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal (Ctrl+C)");
            let _ = signal_tx.send(());
        }
    });

    let result = pipeline.run(shutdown_rx).await;
    drop(shutdown_tx);

    result.context("Pipeline failed")
}

fn validate_config(config: &OrderStreamConfig) -> Result<()> {
    println!("✓ Configuration valid!\n");

    println!("Source:");
    println!("  Bootstrap servers:");
    for server in &config.source.bootstrap_servers {
        println!("    - {}", server);
    }
    println!("  Topic: {}", config.source.topic);
    println!("  Start offset: {:?}", config.source.start_offset);
    println!("  Fail on data loss: {}", config.source.fail_on_data_loss);
    println!();

    println!("Sink:");
    println!("  URL: {}", orderstream_rdbc::connection::redact_url(config.sink.url.expose_secret()));
    println!("  Events table: {}", config.sink.events_table);
    println!("  KPI table: {}", config.sink.kpi_table);
    println!("  Write timeout: {}ms", config.sink.write_timeout_ms);
    println!(
        "  Auto-create tables: {}",
        if config.sink.auto_create_tables {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!();

    println!("Engine:");
    println!("  Window: {}s", config.engine.window_secs);
    println!("  Lateness: {}s", config.engine.lateness_secs);
    println!("  Dedup retention: {}s", config.engine.dedup_retention_secs());
    println!("  Shards: {}", config.engine.shards);
    println!("  Max batch records: {}", config.engine.max_batch_records);
    println!("  Poll interval: {}ms", config.engine.poll_interval_ms);
    println!();

    println!("Retry:");
    println!("  Max retries: {}", config.retry.max_retries);
    println!(
        "  Backoff: {}ms → {}ms (×{})",
        config.retry.initial_backoff_ms, config.retry.max_backoff_ms, config.retry.backoff_multiplier
    );
    println!();

    println!("Checkpoint: {}", config.checkpoint.dir.display());
    if config.metrics.enabled {
        println!("Metrics: http://0.0.0.0:{}/metrics", config.metrics.port);
    }

    Ok(())
}

async fn check_connectivity(config: &OrderStreamConfig) -> Result<()> {
    println!("Running connectivity checks...\n");
    let mut all_passed = true;

    print!("Broker ({:?})... ", config.source.bootstrap_servers);
    match check_broker(config).await {
        Ok(partitions) => println!(
            "✓ topic '{}' has {} partition(s)",
            config.source.topic, partitions
        ),
        Err(e) => {
            println!("✗ failed: {}", e);
            all_passed = false;
        }
    }

    print!("Database... ");
    let sink = RdbcSink::postgres(config.sink.to_rdbc_config());
    match sink.health_check().await {
        Ok(()) => println!("✓ connected"),
        Err(e) => {
            println!("✗ failed: {}", e);
            all_passed = false;
        }
    }

    println!();
    if all_passed {
        println!("✓ All checks passed");
        Ok(())
    } else {
        anyhow::bail!("Some connectivity checks failed")
    }
}

async fn check_broker(config: &OrderStreamConfig) -> Result<usize> {
    let reader_config = config.source.to_reader_config();
    let client = KafkaReader::create_client(&reader_config).await?;
    let partitions = KafkaReader::discover_partitions(&client, &reader_config.topic).await?;
    Ok(partitions.len())
}

async fn show_checkpoint(config: &OrderStreamConfig) -> Result<()> {
    let store = FileCheckpointStore::with_options(&config.checkpoint.dir, false)
        .await
        .context("Failed to open checkpoint directory")?;

    let Some(checkpoint) = store.load(&config.source.topic).await? else {
        println!(
            "No checkpoint for topic '{}' in {}",
            config.source.topic,
            config.checkpoint.dir.display()
        );
        return Ok(());
    };

    println!("Checkpoint for topic '{}':", checkpoint.topic);
    println!("  Batch: {}", checkpoint.batch_id);
    println!("  Created: {}", checkpoint.created_at);
    println!("  Offsets:");
    for (partition, offset) in &checkpoint.offsets {
        println!("    {}: {}", partition, offset);
    }
    match checkpoint.state.watermark.watermark {
        Some(w) => println!("  Watermark: {}", w),
        None => println!("  Watermark: (none)"),
    }
    println!("  Dedup ids: {}", checkpoint.state.dedup.entries.len());
    println!("  Open windows: {}", checkpoint.state.windows.windows.len());

    Ok(())
}
