//! Event-time watermark tracking
//!
//! The watermark `W = maxEventTimeSeen - lateness` is the engine's only notion
//! of progress. Window emission and dedup eviction both key off it, so it
//! must never move backward: [`WatermarkTracker::advance`] only ever returns a
//! value at least as large as the previous one, whatever order events arrive
//! in.
//!
//! ```rust,ignore
//! let mut tracker = WatermarkTracker::new(Duration::minutes(5));
//! tracker.observe(0, t("12:10:00"));
//! tracker.observe(1, t("12:03:00")); // late, W unaffected
//! assert_eq!(tracker.advance(), Some(t("12:05:00")));
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Persisted watermark state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkState {
    pub max_event_time: Option<DateTime<Utc>>,
    pub watermark: Option<DateTime<Utc>>,
}

/// Tracks the maximum observed event time and derives the watermark
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    lateness: Duration,
    max_event_time: Option<DateTime<Utc>>,
    watermark: Option<DateTime<Utc>>,
    /// Max event time per source partition, for lag reporting
    partitions: BTreeMap<i32, DateTime<Utc>>,
}

impl WatermarkTracker {
    pub fn new(lateness: Duration) -> Self {
        Self {
            lateness,
            max_event_time: None,
            watermark: None,
            partitions: BTreeMap::new(),
        }
    }

    pub fn lateness(&self) -> Duration {
        self.lateness
    }

    /// Record a valid event's timestamp.
    ///
    /// Takes effect on the watermark at the next [`advance`](Self::advance).
    /// Returns whether the event is already behind the current watermark.
    pub fn observe(&mut self, partition: i32, event_time: DateTime<Utc>) -> bool {
        let behind = self.watermark.is_some_and(|w| event_time < w);

        self.max_event_time = Some(match self.max_event_time {
            Some(max) => max.max(event_time),
            None => event_time,
        });

        self.partitions
            .entry(partition)
            .and_modify(|max| *max = (*max).max(event_time))
            .or_insert(event_time);
        behind
    }

    /// Recompute the watermark from everything observed so far.
    ///
    /// Called once per micro-batch; returns the current watermark, which is
    /// `None` until the first event has been observed.
    pub fn advance(&mut self) -> Option<DateTime<Utc>> {
        let candidate = self
            .max_event_time
            .and_then(|max| max.checked_sub_signed(self.lateness));

        match (self.watermark, candidate) {
            (Some(current), Some(next)) if next > current => {
                debug!(from = %current, to = %next, "Watermark advanced");
                self.watermark = Some(next);
            }
            (None, Some(next)) => {
                debug!(to = %next, "Watermark initialized");
                self.watermark = Some(next);
            }
            _ => {}
        }

        self.watermark
    }

    pub fn current(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    pub fn max_event_time(&self) -> Option<DateTime<Utc>> {
        self.max_event_time
    }

    /// How far each partition's newest event trails the overall newest event.
    pub fn partition_lags(&self) -> BTreeMap<i32, Duration> {
        let Some(max) = self.max_event_time else {
            return BTreeMap::new();
        };
        self.partitions
            .iter()
            .map(|(partition, newest)| (*partition, max - *newest))
            .collect()
    }

    pub fn snapshot(&self) -> WatermarkState {
        WatermarkState {
            max_event_time: self.max_event_time,
            watermark: self.watermark,
        }
    }

    /// Replace tracked progress with a persisted state.
    ///
    /// Partition lag resets; it is rebuilt as events arrive.
    pub fn restore(&mut self, state: &WatermarkState) {
        self.max_event_time = state.max_event_time;
        self.watermark = state.watermark;
        self.partitions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_no_watermark_before_first_event() {
        let mut tracker = WatermarkTracker::new(Duration::minutes(5));
        assert_eq!(tracker.advance(), None);
        assert_eq!(tracker.current(), None);
    }

    #[test]
    fn test_watermark_is_max_minus_lateness() {
        let mut tracker = WatermarkTracker::new(Duration::minutes(5));
        tracker.observe(0, at(12, 10, 0));
        tracker.observe(0, at(12, 7, 0));
        assert_eq!(tracker.advance(), Some(at(12, 5, 0)));
        assert_eq!(tracker.max_event_time(), Some(at(12, 10, 0)));
    }

    #[test]
    fn test_observation_waits_for_advance() {
        let mut tracker = WatermarkTracker::new(Duration::minutes(5));
        tracker.observe(0, at(12, 10, 0));
        tracker.advance();
        tracker.observe(0, at(12, 20, 0));
        assert_eq!(tracker.current(), Some(at(12, 5, 0)));
        assert_eq!(tracker.advance(), Some(at(12, 15, 0)));
    }

    #[test]
    fn test_late_only_batch_does_not_regress() {
        let mut tracker = WatermarkTracker::new(Duration::minutes(5));
        tracker.observe(0, at(12, 30, 0));
        let w1 = tracker.advance();

        // a batch made only of late events
        assert!(tracker.observe(1, at(11, 0, 0)));
        assert!(tracker.observe(1, at(12, 1, 0)));
        assert!(!tracker.observe(1, at(12, 25, 0)));
        let w2 = tracker.advance();

        assert_eq!(w1, w2);
    }

    #[test]
    fn test_monotonic_across_interleavings() {
        let times = [
            at(12, 0, 0),
            at(12, 9, 0),
            at(12, 2, 0),
            at(12, 9, 30),
            at(11, 50, 0),
            at(12, 15, 0),
            at(12, 14, 59),
        ];

        // every rotation of the arrival order, one event per batch
        for shift in 0..times.len() {
            let mut tracker = WatermarkTracker::new(Duration::minutes(5));
            let mut last = None;
            for i in 0..times.len() {
                tracker.observe(0, times[(i + shift) % times.len()]);
                let w = tracker.advance();
                assert!(w >= last, "watermark regressed from {:?} to {:?}", last, w);
                last = w;
            }
            assert_eq!(last, Some(at(12, 10, 0)));
        }
    }

    #[test]
    fn test_partition_lag() {
        let mut tracker = WatermarkTracker::new(Duration::minutes(5));
        tracker.observe(0, at(12, 10, 0));
        tracker.observe(1, at(12, 8, 30));
        assert_eq!(
            tracker.partition_lags(),
            BTreeMap::from([(0, Duration::zero()), (1, Duration::seconds(90))])
        );

        let state = tracker.snapshot();
        tracker.restore(&state);
        assert!(tracker.partition_lags().is_empty());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut tracker = WatermarkTracker::new(Duration::minutes(5));
        tracker.observe(0, at(12, 10, 0));
        tracker.advance();
        let state = tracker.snapshot();

        let mut restored = WatermarkTracker::new(Duration::minutes(5));
        restored.restore(&state);
        assert_eq!(restored.current(), Some(at(12, 5, 0)));

        // restored progress still never regresses
        restored.observe(0, at(12, 1, 0));
        assert_eq!(restored.advance(), Some(at(12, 5, 0)));
    }
}
