//! In-memory sink with the same idempotence rules as the relational sink.
//!
//! Useful for tests and dry runs. Failures and slow writes can be injected
//! to exercise retry and replay paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::{StreamSink, WriteResult};
use crate::error::{Result, StreamError};
use crate::event::CleanEvent;
use crate::window::KpiRow;

#[derive(Default)]
struct Tables {
    events: BTreeMap<String, CleanEvent>,
    kpis: BTreeMap<(DateTime<Utc>, DateTime<Utc>), KpiRow>,
}

/// Sink that keeps both tables in memory
#[derive(Default)]
pub struct MemorySink {
    tables: Mutex<Tables>,
    fail_writes: AtomicU32,
    write_calls: AtomicU64,
    write_delay: Mutex<Option<Duration>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` write calls, on either table, with a retriable error.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Delay every write, e.g. to trigger write timeouts.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = Some(delay);
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn event_count(&self) -> usize {
        self.tables.lock().events.len()
    }

    pub fn event(&self, id: &str) -> Option<CleanEvent> {
        self.tables.lock().events.get(id).cloned()
    }

    /// Event ids in key order
    pub fn event_ids(&self) -> Vec<String> {
        self.tables.lock().events.keys().cloned().collect()
    }

    /// KPI rows ordered by window
    pub fn kpi_rows(&self) -> Vec<KpiRow> {
        self.tables.lock().kpis.values().cloned().collect()
    }

    pub fn kpi_row(&self, window_start: DateTime<Utc>) -> Option<KpiRow> {
        self.tables
            .lock()
            .kpis
            .values()
            .find(|r| r.window_start == window_start)
            .cloned()
    }

    async fn begin_write(&self, table: &str) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failed = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StreamError::sink_write(table, "injected write failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl StreamSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn events_table(&self) -> &str {
        "events_clean"
    }

    fn kpi_table(&self) -> &str {
        "kpi_1m"
    }

    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_events(&self, events: &[CleanEvent]) -> Result<WriteResult> {
        self.begin_write(self.events_table()).await?;

        let mut tables = self.tables.lock();
        let mut inserted = 0;
        for event in events {
            if !tables.events.contains_key(event.id()) {
                tables.events.insert(event.id().to_string(), event.clone());
                inserted += 1;
            }
        }
        Ok(WriteResult::new(events.len() as u64, inserted))
    }

    async fn upsert_kpis(&self, rows: &[KpiRow]) -> Result<WriteResult> {
        self.begin_write(self.kpi_table()).await?;

        let mut tables = self.tables.lock();
        for row in rows {
            tables
                .kpis
                .insert((row.window_start, row.window_end), row.clone());
        }
        Ok(WriteResult::new(rows.len() as u64, rows.len() as u64))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
