//! Pipeline counters and Prometheus exposition
//!
//! Counters are plain atomics updated by the pipeline after each batch. They
//! back the periodic summary log line and, when enabled, a `/metrics`
//! endpoint in Prometheus text format:
//! - records pulled, processed and rejected (by kind)
//! - duplicates, late-dropped events and events behind the watermark
//! - rows written per table
//! - committed and failed batches
//! - current watermark, state sizes and per-partition event-time lag

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::engine::BatchStats;

const NO_WATERMARK: i64 = i64::MIN;

/// Shared pipeline counters
#[derive(Debug)]
pub struct PipelineMetrics {
    started_at: Instant,
    pub records_pulled: AtomicU64,
    pub records_processed: AtomicU64,
    pub rejected_parse: AtomicU64,
    pub rejected_validation: AtomicU64,
    pub duplicates: AtomicU64,
    pub late_dropped: AtomicU64,
    pub behind_watermark: AtomicU64,
    pub events_written: AtomicU64,
    pub kpi_rows_written: AtomicU64,
    pub batches_committed: AtomicU64,
    pub batches_failed: AtomicU64,
    pub poll_errors: AtomicU64,
    pub windows_closed: AtomicU64,
    pub dedup_keys_purged: AtomicU64,
    watermark_micros: AtomicI64,
    pub dedup_keys: AtomicU64,
    pub open_windows: AtomicU64,
    partition_lags: Mutex<BTreeMap<i32, Duration>>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            records_pulled: AtomicU64::new(0),
            records_processed: AtomicU64::new(0),
            rejected_parse: AtomicU64::new(0),
            rejected_validation: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            late_dropped: AtomicU64::new(0),
            behind_watermark: AtomicU64::new(0),
            events_written: AtomicU64::new(0),
            kpi_rows_written: AtomicU64::new(0),
            batches_committed: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
            windows_closed: AtomicU64::new(0),
            dedup_keys_purged: AtomicU64::new(0),
            watermark_micros: AtomicI64::new(NO_WATERMARK),
            dedup_keys: AtomicU64::new(0),
            open_windows: AtomicU64::new(0),
            partition_lags: Mutex::new(BTreeMap::new()),
        }
    }
}

pub type SharedMetrics = Arc<PipelineMetrics>;

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub records_pulled: u64,
    pub records_processed: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub late_dropped: u64,
    pub behind_watermark: u64,
    pub events_written: u64,
    pub kpi_rows_written: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub watermark: Option<DateTime<Utc>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the engine counters of a committed batch.
    pub fn record_batch(&self, stats: &BatchStats) {
        self.records_pulled.fetch_add(stats.pulled, Ordering::Relaxed);
        self.records_processed.fetch_add(stats.valid, Ordering::Relaxed);
        self.rejected_parse
            .fetch_add(stats.parse_rejected, Ordering::Relaxed);
        self.rejected_validation
            .fetch_add(stats.validation_rejected, Ordering::Relaxed);
        self.duplicates.fetch_add(stats.duplicates, Ordering::Relaxed);
        self.late_dropped
            .fetch_add(stats.late_dropped, Ordering::Relaxed);
        self.behind_watermark
            .fetch_add(stats.behind_watermark, Ordering::Relaxed);
        self.windows_closed
            .fetch_add(stats.windows_closed, Ordering::Relaxed);
        self.dedup_keys_purged
            .fetch_add(stats.dedup_purged, Ordering::Relaxed);
    }

    pub fn record_writes(&self, events: u64, kpi_rows: u64) {
        self.events_written.fetch_add(events, Ordering::Relaxed);
        self.kpi_rows_written.fetch_add(kpi_rows, Ordering::Relaxed);
    }

    pub fn set_watermark(&self, watermark: Option<DateTime<Utc>>) {
        let micros = watermark.map_or(NO_WATERMARK, |w| w.timestamp_micros());
        self.watermark_micros.store(micros, Ordering::Relaxed);
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        match self.watermark_micros.load(Ordering::Relaxed) {
            NO_WATERMARK => None,
            micros => DateTime::from_timestamp_micros(micros),
        }
    }

    pub fn set_state_sizes(&self, dedup_keys: usize, open_windows: usize) {
        self.dedup_keys.store(dedup_keys as u64, Ordering::Relaxed);
        self.open_windows
            .store(open_windows as u64, Ordering::Relaxed);
    }

    pub fn set_partition_lags(&self, lags: BTreeMap<i32, Duration>) {
        *self.partition_lags.lock() = lags;
    }

    pub fn partition_lags(&self) -> BTreeMap<i32, Duration> {
        self.partition_lags.lock().clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_pulled: self.records_pulled.load(Ordering::Relaxed),
            records_processed: self.records_processed.load(Ordering::Relaxed),
            rejected: self.rejected_parse.load(Ordering::Relaxed)
                + self.rejected_validation.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            late_dropped: self.late_dropped.load(Ordering::Relaxed),
            behind_watermark: self.behind_watermark.load(Ordering::Relaxed),
            events_written: self.events_written.load(Ordering::Relaxed),
            kpi_rows_written: self.kpi_rows_written.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            watermark: self.watermark(),
        }
    }

    /// Emit the periodic summary line.
    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            pulled = s.records_pulled,
            processed = s.records_processed,
            rejected = s.rejected,
            duplicates = s.duplicates,
            late_dropped = s.late_dropped,
            behind_watermark = s.behind_watermark,
            failed = s.batches_failed,
            committed = s.batches_committed,
            watermark = ?s.watermark,
            "Pipeline summary"
        );
    }

    /// Render all counters in Prometheus text format
    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        let counter = |out: &mut String, name: &str, help: &str, value: u64| {
            out.push_str(&format!("# HELP orderstream_{} {}\n", name, help));
            out.push_str(&format!("# TYPE orderstream_{} counter\n", name));
            out.push_str(&format!("orderstream_{} {}\n\n", name, value));
        };
        let gauge = |out: &mut String, name: &str, help: &str, value: String| {
            out.push_str(&format!("# HELP orderstream_{} {}\n", name, help));
            out.push_str(&format!("# TYPE orderstream_{} gauge\n", name));
            out.push_str(&format!("orderstream_{} {}\n\n", name, value));
        };

        gauge(
            &mut output,
            "uptime_seconds",
            "Time since the pipeline started",
            format!("{:.3}", self.started_at.elapsed().as_secs_f64()),
        );
        counter(
            &mut output,
            "records_pulled_total",
            "Records read from the broker",
            self.records_pulled.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "records_processed_total",
            "Records that passed validation",
            self.records_processed.load(Ordering::Relaxed),
        );

        output.push_str("# HELP orderstream_records_rejected_total Records rejected by kind\n");
        output.push_str("# TYPE orderstream_records_rejected_total counter\n");
        output.push_str(&format!(
            "orderstream_records_rejected_total{{kind=\"parse\"}} {}\n",
            self.rejected_parse.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "orderstream_records_rejected_total{{kind=\"validation\"}} {}\n\n",
            self.rejected_validation.load(Ordering::Relaxed)
        ));

        counter(
            &mut output,
            "duplicates_total",
            "Events dropped as duplicates",
            self.duplicates.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "late_dropped_total",
            "Events too late for aggregation",
            self.late_dropped.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "events_behind_watermark_total",
            "Valid events older than the watermark when they arrived",
            self.behind_watermark.load(Ordering::Relaxed),
        );

        output.push_str("# HELP orderstream_rows_written_total Rows written per table\n");
        output.push_str("# TYPE orderstream_rows_written_total counter\n");
        output.push_str(&format!(
            "orderstream_rows_written_total{{table=\"events\"}} {}\n",
            self.events_written.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "orderstream_rows_written_total{{table=\"kpi\"}} {}\n\n",
            self.kpi_rows_written.load(Ordering::Relaxed)
        ));

        counter(
            &mut output,
            "batches_committed_total",
            "Batches written and checkpointed",
            self.batches_committed.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "batches_failed_total",
            "Batches whose sink writes were exhausted",
            self.batches_failed.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "poll_errors_total",
            "Failed broker polls",
            self.poll_errors.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "windows_closed_total",
            "Windows finalized and evicted",
            self.windows_closed.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "dedup_keys_purged_total",
            "Event ids forgotten after the watermark passed their expiry",
            self.dedup_keys_purged.load(Ordering::Relaxed),
        );

        if let Some(w) = self.watermark() {
            gauge(
                &mut output,
                "watermark_seconds",
                "Current event-time watermark as a Unix timestamp",
                format!("{:.6}", w.timestamp_micros() as f64 / 1_000_000.0),
            );
        }
        gauge(
            &mut output,
            "dedup_keys",
            "Event ids held for deduplication",
            self.dedup_keys.load(Ordering::Relaxed).to_string(),
        );
        gauge(
            &mut output,
            "open_windows",
            "Windows held in memory",
            self.open_windows.load(Ordering::Relaxed).to_string(),
        );

        let lags = self.partition_lags();
        if !lags.is_empty() {
            output.push_str(
                "# HELP orderstream_partition_lag_seconds Event-time lag of each partition behind the newest event\n",
            );
            output.push_str("# TYPE orderstream_partition_lag_seconds gauge\n");
            for (partition, lag) in &lags {
                output.push_str(&format!(
                    "orderstream_partition_lag_seconds{{partition=\"{}\"}} {:.3}\n",
                    partition,
                    lag.num_milliseconds() as f64 / 1_000.0
                ));
            }
            output.push('\n');
        }

        output
    }
}

/// Serve `GET /metrics` until the listener fails
pub async fn start_metrics_server(port: u16, metrics: SharedMetrics) -> std::io::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Metrics server listening on http://0.0.0.0:{}/metrics", port);

    loop {
        let (stream, _) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let _ = handle_metrics_request(stream, metrics).await;
        });
    }
}

async fn handle_metrics_request(
    mut stream: tokio::net::TcpStream,
    metrics: SharedMetrics,
) -> std::io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buf[..n]);
    if !request.starts_with("GET /metrics") {
        let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        stream.write_all(response.as_bytes()).await?;
        return Ok(());
    }

    let body = metrics.render_prometheus();
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_batch_accumulates() {
        let metrics = PipelineMetrics::new();
        let stats = BatchStats {
            pulled: 10,
            valid: 8,
            parse_rejected: 1,
            validation_rejected: 1,
            duplicates: 2,
            late_dropped: 1,
            behind_watermark: 3,
            dedup_purged: 4,
            ..Default::default()
        };
        metrics.record_batch(&stats);
        metrics.record_batch(&stats);

        let s = metrics.snapshot();
        assert_eq!(s.records_pulled, 20);
        assert_eq!(s.records_processed, 16);
        assert_eq!(s.rejected, 4);
        assert_eq!(s.duplicates, 4);
        assert_eq!(s.late_dropped, 2);
        assert_eq!(s.behind_watermark, 6);
        assert_eq!(metrics.dedup_keys_purged.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn test_watermark_gauge() {
        let metrics = PipelineMetrics::new();
        assert_eq!(metrics.watermark(), None);
        assert!(!metrics.render_prometheus().contains("watermark_seconds"));

        let w = Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 0).unwrap();
        metrics.set_watermark(Some(w));
        assert_eq!(metrics.watermark(), Some(w));
        assert!(metrics
            .render_prometheus()
            .contains(&format!("orderstream_watermark_seconds {}.000000", w.timestamp())));
    }

    #[test]
    fn test_render_prometheus() {
        let metrics = PipelineMetrics::new();
        metrics.record_writes(5, 2);
        metrics.rejected_parse.fetch_add(3, Ordering::Relaxed);

        let output = metrics.render_prometheus();
        assert!(output.contains("# TYPE orderstream_records_pulled_total counter"));
        assert!(output.contains("orderstream_records_rejected_total{kind=\"parse\"} 3"));
        assert!(output.contains("orderstream_rows_written_total{table=\"events\"} 5"));
        assert!(output.contains("orderstream_rows_written_total{table=\"kpi\"} 2"));
        assert!(output.contains("orderstream_events_behind_watermark_total 0"));
        assert!(!output.contains("partition_lag_seconds"));
    }

    #[test]
    fn test_partition_lag_gauges() {
        let metrics = PipelineMetrics::new();
        metrics.set_partition_lags(BTreeMap::from([
            (0, Duration::zero()),
            (2, Duration::milliseconds(90_500)),
        ]));

        let output = metrics.render_prometheus();
        assert!(output.contains("# TYPE orderstream_partition_lag_seconds gauge"));
        assert!(output.contains("orderstream_partition_lag_seconds{partition=\"0\"} 0.000"));
        assert!(output.contains("orderstream_partition_lag_seconds{partition=\"2\"} 90.500"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics = Arc::new(PipelineMetrics::new());
        metrics.duplicates.fetch_add(7, Ordering::Relaxed);

        let served = metrics.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_metrics_request(stream, served).await.unwrap();
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("orderstream_duplicates_total 7"));
    }
}
