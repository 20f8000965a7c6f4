//! Micro-batch processing core
//!
//! [`StreamEngine`] owns the watermark tracker, dedup store and window
//! aggregator and runs one batch of raw records through them:
//!
//! 1. validate each record, counting and logging rejections
//! 2. observe the event time, admit by id, fold into the event's window
//!    using the watermark of the previous batch
//! 3. advance the watermark once for the whole batch
//! 4. emit eligible windows and purge expired dedup keys
//!
//! The engine performs no I/O. The pipeline decides what to do with the
//! output and when the resulting state is committed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::dedup::{DedupConfig, DedupState, DedupStore};
use crate::event::CleanEvent;
use crate::source::RawRecord;
use crate::validate::{RejectionKind, SchemaValidator};
use crate::watermark::{WatermarkState, WatermarkTracker};
use crate::window::{FoldOutcome, KpiRow, WindowAggregator, WindowState};

/// Engine tuning, already converted to durations
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub window: Duration,
    pub lateness: Duration,
    pub dedup_retention: Duration,
    pub shards: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window: Duration::minutes(1),
            lateness: Duration::minutes(5),
            dedup_retention: Duration::minutes(5),
            shards: 4,
        }
    }
}

/// Everything needed to resume processing exactly where a batch left off
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    pub watermark: WatermarkState,
    pub dedup: DedupState,
    pub windows: WindowState,
}

/// Per-batch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub pulled: u64,
    pub valid: u64,
    pub parse_rejected: u64,
    pub validation_rejected: u64,
    pub duplicates: u64,
    pub late_dropped: u64,
    /// Valid events older than the watermark they arrived under
    pub behind_watermark: u64,
    pub clean: u64,
    pub kpi_rows: u64,
    pub windows_closed: u64,
    pub dedup_purged: u64,
}

impl BatchStats {
    pub fn rejected(&self) -> u64 {
        self.parse_rejected + self.validation_rejected
    }
}

/// What one batch produced
#[derive(Debug, Clone, Default)]
pub struct BatchOutput {
    /// Admitted events, in arrival order
    pub clean_events: Vec<CleanEvent>,
    /// Window rows to upsert, ordered by window start
    pub kpi_rows: Vec<KpiRow>,
    /// Watermark after this batch
    pub watermark: Option<DateTime<Utc>>,
    pub stats: BatchStats,
}

impl BatchOutput {
    pub fn is_empty(&self) -> bool {
        self.clean_events.is_empty() && self.kpi_rows.is_empty()
    }
}

pub struct StreamEngine {
    config: EngineConfig,
    validator: SchemaValidator,
    watermark: WatermarkTracker,
    dedup: DedupStore,
    windows: WindowAggregator,
}

impl StreamEngine {
    pub fn new(config: EngineConfig) -> Self {
        let watermark = WatermarkTracker::new(config.lateness);
        let dedup = DedupStore::new(
            DedupConfig::new(config.dedup_retention).with_shards(config.shards),
        );
        let windows = WindowAggregator::new(config.window, config.lateness, config.shards);
        Self {
            config,
            validator: SchemaValidator::new(),
            watermark,
            dedup,
            windows,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one micro-batch through the engine.
    pub fn process(&mut self, records: &[RawRecord], ingest_time: DateTime<Utc>) -> BatchOutput {
        let mut stats = BatchStats {
            pulled: records.len() as u64,
            ..Default::default()
        };
        let fold_watermark = self.watermark.current();
        let mut clean_events = Vec::new();

        for record in records {
            let event = match self.validator.validate(record) {
                Ok(event) => event,
                Err(reason) => {
                    match reason.kind() {
                        RejectionKind::Parse => stats.parse_rejected += 1,
                        RejectionKind::Validation => stats.validation_rejected += 1,
                    }
                    warn!(
                        partition = record.partition,
                        offset = record.offset,
                        kind = reason.kind().as_str(),
                        reason = %reason,
                        "Rejected record"
                    );
                    continue;
                }
            };
            stats.valid += 1;
            if self.watermark.observe(record.partition, event.event_time) {
                stats.behind_watermark += 1;
            }

            if !self.dedup.admit(&event) {
                stats.duplicates += 1;
                debug!(id = %event.id, offset = record.offset, "Dropped duplicate event");
                continue;
            }

            let clean = CleanEvent::new(event, ingest_time);
            match self.windows.fold(&clean, fold_watermark) {
                FoldOutcome::Folded(_) => {}
                FoldOutcome::TooLate(window) => {
                    stats.late_dropped += 1;
                    debug!(
                        id = clean.id(),
                        event_time = %clean.event.event_time,
                        window_end = %window.end,
                        "Event too late for aggregation"
                    );
                }
                FoldOutcome::OutOfRange => {
                    stats.late_dropped += 1;
                    warn!(
                        id = clean.id(),
                        event_time = %clean.event.event_time,
                        "Event time has no window, not aggregated"
                    );
                }
            }
            clean_events.push(clean);
        }
        stats.clean = clean_events.len() as u64;

        let watermark = self.watermark.advance();
        let mut kpi_rows = Vec::new();
        if let Some(w) = watermark {
            let emission = self.windows.emit(w);
            for row in emission.rows.iter().filter(|r| r.is_final) {
                info!(
                    window_start = %row.window_start,
                    revenue = %row.revenue,
                    orders_created = row.orders_created,
                    payment_success = row.payment_success,
                    payment_failed = row.payment_failed,
                    success_rate = %row.success_rate,
                    "Window finalized"
                );
            }
            stats.windows_closed = emission.closed as u64;
            kpi_rows = emission.rows;
            stats.dedup_purged = self.dedup.purge(w) as u64;
        }
        stats.kpi_rows = kpi_rows.len() as u64;

        BatchOutput {
            clean_events,
            kpi_rows,
            watermark,
            stats,
        }
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark.current()
    }

    /// Event-time lag of each partition behind the newest event seen
    pub fn partition_lags(&self) -> BTreeMap<i32, Duration> {
        self.watermark.partition_lags()
    }

    /// Ids held for dedup and windows held open
    pub fn state_sizes(&self) -> (usize, usize) {
        (self.dedup.len(), self.windows.len())
    }

    pub fn snapshot(&self) -> EngineState {
        EngineState {
            watermark: self.watermark.snapshot(),
            dedup: self.dedup.snapshot(),
            windows: self.windows.snapshot(),
        }
    }

    pub fn restore(&mut self, state: &EngineState) {
        self.watermark.restore(&state.watermark);
        self.dedup.restore(&state.dedup);
        self.windows.restore(&state.windows);
    }
}
