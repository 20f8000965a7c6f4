//! Pipeline runner - pulls micro-batches, writes them, commits checkpoints
//!
//! Each batch runs to completion before the next poll:
//!
//! ```text
//! poll ─▶ validate ─▶ dedup ─▶ fold ─▶ emit ─▶ write (both tables) ─▶ checkpoint
//! ```
//!
//! Features:
//! - Recovery of engine state and read positions from the last checkpoint
//! - Rewind and replay of a batch whose sink writes were exhausted
//! - Bounded run of consecutive failed batches before giving up
//! - Graceful shutdown between batches, never mid-write
//! - Periodic summary log line

use chrono::Utc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::OrderStreamConfig;
use crate::engine::{BatchStats, EngineState, StreamEngine};
use crate::error::{Result, StreamError};
use crate::metrics::SharedMetrics;
use crate::sink::SinkWriter;
use crate::source::{Positions, RecordReader};

/// Loop tuning
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_batch_records: usize,
    /// Pause after an empty or failed batch
    pub poll_interval: Duration,
    /// Consecutive exhausted batches tolerated before the run fails
    pub max_batch_failures: u32,
    pub stats_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_batch_records: 500,
            poll_interval: Duration::from_secs(1),
            max_batch_failures: 3,
            stats_interval: Duration::from_secs(30),
        }
    }
}

impl From<&OrderStreamConfig> for PipelineSettings {
    fn from(config: &OrderStreamConfig) -> Self {
        Self {
            max_batch_records: config.engine.max_batch_records,
            poll_interval: config.engine.poll_interval(),
            max_batch_failures: config.engine.max_batch_failures,
            stats_interval: Duration::from_secs(config.stats_interval_secs),
        }
    }
}

/// What a single [`Pipeline::run_once`] call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Nothing to read, or the poll failed transiently
    Idle,
    /// Written to both tables and checkpointed
    Committed { batch_id: u64, stats: BatchStats },
    /// Sink writes were exhausted; state and positions were rewound
    Failed { consecutive: u32 },
}

pub struct Pipeline {
    reader: Box<dyn RecordReader>,
    engine: StreamEngine,
    writer: SinkWriter,
    checkpoints: CheckpointManager,
    metrics: SharedMetrics,
    settings: PipelineSettings,
    consecutive_failures: u32,
}

impl Pipeline {
    pub fn new(
        reader: Box<dyn RecordReader>,
        engine: StreamEngine,
        writer: SinkWriter,
        checkpoints: CheckpointManager,
        metrics: SharedMetrics,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            reader,
            engine,
            writer,
            checkpoints,
            metrics,
            settings,
            consecutive_failures: 0,
        }
    }

    pub fn engine(&self) -> &StreamEngine {
        &self.engine
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn positions(&self) -> Positions {
        self.reader.positions()
    }

    pub fn last_batch_id(&self) -> Option<u64> {
        self.checkpoints.last_committed().map(|cp| cp.batch_id)
    }

    /// Resume from the last committed checkpoint.
    ///
    /// Must run before the first batch. Any checkpoint problem is fatal.
    pub async fn recover(&mut self) -> Result<Option<u64>> {
        let Some(checkpoint) = self.checkpoints.recover().await? else {
            return Ok(None);
        };

        self.engine.restore(&checkpoint.state);
        self.reader.seek(&checkpoint.offsets).await?;
        self.update_gauges();

        Ok(Some(checkpoint.batch_id))
    }

    /// Process one micro-batch end to end.
    pub async fn run_once(&mut self) -> Result<BatchOutcome> {
        let start_positions = self.reader.positions();

        let records = match self.reader.poll(self.settings.max_batch_records).await {
            Ok(records) => records,
            Err(e) => {
                // a failed poll must not leave positions past undelivered records
                self.reader.seek(&start_positions).await?;
                if !e.is_retriable() {
                    return Err(e);
                }
                self.metrics.poll_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(source = %self.reader.describe(), error = %e, "Poll failed");
                return Ok(BatchOutcome::Idle);
            }
        };

        if records.is_empty() {
            debug!("Empty micro-batch, skipping");
            return Ok(BatchOutcome::Idle);
        }

        let output = self.engine.process(&records, Utc::now());

        match self
            .writer
            .write_batch(&output.clean_events, &output.kpi_rows)
            .await
        {
            Ok(written) => {
                let offsets = self.reader.positions();
                let committed = self.checkpoints.commit(offsets, self.engine.snapshot()).await?;
                let batch_id = committed.batch_id;

                self.consecutive_failures = 0;
                self.metrics.record_batch(&output.stats);
                self.metrics
                    .record_writes(written.events.rows_affected, written.kpis.rows_written);
                self.metrics
                    .batches_committed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.update_gauges();

                debug!(
                    batch_id,
                    pulled = output.stats.pulled,
                    clean = output.stats.clean,
                    rejected = output.stats.rejected(),
                    duplicates = output.stats.duplicates,
                    late_dropped = output.stats.late_dropped,
                    kpi_rows = output.stats.kpi_rows,
                    watermark = ?output.watermark,
                    "Batch committed"
                );

                Ok(BatchOutcome::Committed {
                    batch_id,
                    stats: output.stats,
                })
            }
            Err(e @ StreamError::SinkExhausted { .. }) => {
                self.consecutive_failures += 1;
                self.metrics
                    .batches_failed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                error!(
                    consecutive = self.consecutive_failures,
                    max = self.settings.max_batch_failures,
                    records = records.len(),
                    error = %e,
                    "Batch failed, checkpoint not advanced"
                );

                self.rewind(&start_positions).await?;

                if self.consecutive_failures >= self.settings.max_batch_failures {
                    return Err(e);
                }
                Ok(BatchOutcome::Failed {
                    consecutive: self.consecutive_failures,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Put engine state and read positions back where the last commit left them.
    async fn rewind(&mut self, positions: &Positions) -> Result<()> {
        match self.checkpoints.last_committed() {
            Some(checkpoint) => self.engine.restore(&checkpoint.state),
            None => self.engine.restore(&EngineState::default()),
        }
        self.reader.seek(positions).await?;
        self.update_gauges();
        Ok(())
    }

    fn update_gauges(&self) {
        let (dedup_keys, open_windows) = self.engine.state_sizes();
        self.metrics.set_watermark(self.engine.watermark());
        self.metrics.set_state_sizes(dedup_keys, open_windows);
        self.metrics.set_partition_lags(self.engine.partition_lags());
    }

    /// Run until shutdown or a fatal error.
    ///
    /// Shutdown is only observed between batches, so an in-flight batch
    /// always finishes its writes and checkpoint.
    pub async fn run(&mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(
            source = %self.reader.describe(),
            sink = self.writer.sink().name(),
            max_batch_records = self.settings.max_batch_records,
            "Pipeline running"
        );

        let mut last_summary = Instant::now();

        loop {
            match shutdown_rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => {
                    info!("Shutdown requested, stopping after last committed batch");
                    break;
                }
            }

            if last_summary.elapsed() >= self.settings.stats_interval {
                self.metrics.log_summary();
                last_summary = Instant::now();
            }

            match self.run_once().await? {
                BatchOutcome::Committed { .. } => {}
                BatchOutcome::Idle | BatchOutcome::Failed { .. } => {
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            info!("Shutdown requested while idle");
                            break;
                        }
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    }
                }
            }
        }

        self.metrics.log_summary();
        info!(last_batch = ?self.last_batch_id(), "Pipeline stopped");
        Ok(())
    }
}
