//! Sink writers
//!
//! Two idempotent outputs per batch:
//!
//! | Table | Semantics | Key |
//! |-------|-----------|-----|
//! | `events_clean` | insert if absent | `id` |
//! | `kpi_1m` | upsert | `(window_start, window_end)` |
//!
//! [`SinkWriter`] issues both writes concurrently, bounds each attempt with
//! a timeout and retries per [`RetryPolicy`]. When a write cannot be
//! completed the whole batch fails with [`StreamError::SinkExhausted`] and
//! the checkpoint must not advance.

pub mod memory;
pub mod rdbc;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, StreamError};
use crate::event::CleanEvent;
use crate::retry::{retry, RetryPolicy};
use crate::window::KpiRow;

pub use memory::MemorySink;
pub use rdbc::{RdbcSink, RdbcSinkConfig};

/// Outcome of one table write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResult {
    /// Rows sent to the store
    pub rows_written: u64,
    /// Rows the store actually inserted or changed
    pub rows_affected: u64,
}

impl WriteResult {
    pub fn new(rows_written: u64, rows_affected: u64) -> Self {
        Self {
            rows_written,
            rows_affected,
        }
    }

    /// Rows the store already had
    pub fn rows_skipped(&self) -> u64 {
        self.rows_written.saturating_sub(self.rows_affected)
    }
}

/// Destination for clean events and KPI rows.
///
/// Both writes must be idempotent: replaying a batch leaves the store as if
/// it had been written once.
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    fn events_table(&self) -> &str;

    fn kpi_table(&self) -> &str;

    /// Create missing tables
    async fn ensure_schema(&self) -> Result<()>;

    /// Insert events whose id is not present yet
    async fn insert_events(&self, events: &[CleanEvent]) -> Result<WriteResult>;

    /// Insert or overwrite window rows
    async fn upsert_kpis(&self, rows: &[KpiRow]) -> Result<WriteResult>;

    /// Verify the store is reachable
    async fn health_check(&self) -> Result<()>;
}

/// Result of writing one batch to both tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchWrite {
    pub events: WriteResult,
    pub kpis: WriteResult,
}

/// Applies timeouts and retries around a [`StreamSink`]
pub struct SinkWriter {
    sink: Arc<dyn StreamSink>,
    write_timeout: Duration,
    retry: RetryPolicy,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn StreamSink>, write_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            sink,
            write_timeout,
            retry,
        }
    }

    pub fn sink(&self) -> &Arc<dyn StreamSink> {
        &self.sink
    }

    /// Write one batch's output to both tables.
    ///
    /// The two tables are written concurrently and both writes always run to
    /// completion, so a failure on one never cancels the other mid-statement.
    pub async fn write_batch(&self, events: &[CleanEvent], kpis: &[KpiRow]) -> Result<BatchWrite> {
        let (events_result, kpi_result) =
            tokio::join!(self.write_events(events), self.write_kpis(kpis));

        Ok(BatchWrite {
            events: events_result?,
            kpis: kpi_result?,
        })
    }

    async fn write_events(&self, events: &[CleanEvent]) -> Result<WriteResult> {
        if events.is_empty() {
            return Ok(WriteResult::default());
        }
        let table = self.sink.events_table();
        self.with_retry(table, || self.sink.insert_events(events)).await
    }

    async fn write_kpis(&self, rows: &[KpiRow]) -> Result<WriteResult> {
        if rows.is_empty() {
            return Ok(WriteResult::default());
        }
        let table = self.sink.kpi_table();
        self.with_retry(table, || self.sink.upsert_kpis(rows)).await
    }

    async fn with_retry<F, Fut>(&self, table: &str, mut write: F) -> Result<WriteResult>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<WriteResult>>,
    {
        let timeout = self.write_timeout;
        let outcome = retry(&self.retry, table, || {
            let attempt = write();
            async move {
                tokio::time::timeout(timeout, attempt)
                    .await
                    .map_err(|_| {
                        StreamError::timeout(format!("write to {} exceeded {}ms", table, timeout.as_millis()))
                    })?
            }
        })
        .await;

        let attempts = outcome.attempts;
        match outcome.into_result() {
            Ok(result) => {
                debug!(
                    table,
                    rows = result.rows_written,
                    affected = result.rows_affected,
                    attempts,
                    "Sink write complete"
                );
                Ok(result)
            }
            Err(e) => Err(StreamError::SinkExhausted {
                table: table.to_string(),
                attempts,
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventType};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    fn events(ids: &[&str]) -> Vec<CleanEvent> {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        ids.iter()
            .map(|id| {
                CleanEvent::new(
                    Event {
                        id: id.to_string(),
                        event_time: t,
                        event_type: EventType::OrderCreated,
                        order_id: "ORD-1".into(),
                        user_id: None,
                        amount: Decimal::from(100),
                        currency: None,
                        status: None,
                    },
                    t,
                )
            })
            .collect()
    }

    fn writer(sink: Arc<MemorySink>, retries: u32) -> SinkWriter {
        SinkWriter::new(
            sink,
            Duration::from_secs(5),
            RetryPolicy::fixed_delay(retries, Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next_writes(10);
        let result = writer(sink.clone(), 0).write_batch(&[], &[]).await.unwrap();
        assert_eq!(result, BatchWrite::default());
        assert_eq!(sink.write_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next_writes(2);
        let result = writer(sink.clone(), 3)
            .write_batch(&events(&["a", "b"]), &[])
            .await
            .unwrap();
        assert_eq!(result.events.rows_affected, 2);
        assert_eq!(sink.event_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_are_fatal() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next_writes(100);
        let err = writer(sink.clone(), 2)
            .write_batch(&events(&["a"]), &[])
            .await
            .unwrap_err();

        match &err {
            StreamError::SinkExhausted { table, attempts, .. } => {
                assert_eq!(table, "events_clean");
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_fatal());
        assert_eq!(sink.event_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_write_times_out() {
        let sink = Arc::new(MemorySink::new());
        sink.set_write_delay(Duration::from_secs(60));
        let err = writer(sink, 1)
            .write_batch(&events(&["a"]), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::SinkExhausted { attempts: 2, .. }));
        assert!(err.to_string().contains("exceeded"));
    }
}
