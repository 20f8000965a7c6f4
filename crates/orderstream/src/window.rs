//! # Tumbling KPI windows
//!
//! Events are bucketed into fixed, epoch-aligned windows
//! (`start = floor(eventTime / size) * size`) and folded into a
//! [`WindowAggregate`] per bucket.
//!
//! ## Lifecycle
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | `end > W` | open, accepts folds, not emitted |
//! | `end <= W < end + lateness` | emitted on every call to [`WindowAggregator::emit`] |
//! | `end + lateness <= W` | final emission, then evicted |
//!
//! An event whose window already satisfies `end <= W` when it is folded is
//! too late and leaves every aggregate untouched. Since the watermark never
//! moves backward, an evicted window cannot be recreated.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::event::{CleanEvent, EventType};
use crate::types::shard_index;

/// Identity of one tumbling window
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WindowKey {
    /// The window of width `size` that contains `t`.
    ///
    /// `None` when the window bounds fall outside the representable range.
    pub fn containing(t: DateTime<Utc>, size: Duration) -> Option<Self> {
        let size_us = size.num_microseconds().unwrap_or(60_000_000).max(1);
        let into_window = t.timestamp_micros().rem_euclid(size_us);
        let sub_micros = i64::from(t.timestamp_subsec_nanos() % 1_000);
        let start = t
            .checked_sub_signed(Duration::microseconds(into_window))?
            .checked_sub_signed(Duration::nanoseconds(sub_micros))?;
        let end = start.checked_add_signed(Duration::microseconds(size_us))?;
        Some(Self { start, end })
    }
}

/// `round(success / (success + failed) * 100, 2)`, or 0 with no payments.
pub fn success_rate(success: u64, failed: u64) -> Decimal {
    let total = success + failed;
    if total == 0 {
        return Decimal::ZERO;
    }
    (Decimal::from(success) * Decimal::ONE_HUNDRED / Decimal::from(total))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Running KPI totals for one window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowAggregate {
    /// Sum of `amount` over successful payments
    pub revenue: Decimal,
    pub orders_created: u64,
    pub payment_success: u64,
    pub payment_failed: u64,
    /// Events folded, of any type
    pub events: u64,
}

impl WindowAggregate {
    pub fn apply(&mut self, event_type: EventType, amount: Decimal) {
        self.events += 1;
        match event_type {
            EventType::OrderCreated => self.orders_created += 1,
            EventType::PaymentSuccess => {
                self.payment_success += 1;
                self.revenue += amount;
            }
            EventType::PaymentFailed => self.payment_failed += 1,
            EventType::PaymentInitiated | EventType::OrderCancelled => {}
        }
    }

    /// Combine partial totals of the same window.
    pub fn merge(&mut self, other: &WindowAggregate) {
        self.revenue += other.revenue;
        self.orders_created += other.orders_created;
        self.payment_success += other.payment_success;
        self.payment_failed += other.payment_failed;
        self.events += other.events;
    }

    pub fn success_rate(&self) -> Decimal {
        success_rate(self.payment_success, self.payment_failed)
    }
}

/// One `kpi_1m` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KpiRow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub revenue: Decimal,
    pub orders_created: i64,
    pub payment_success: i64,
    pub payment_failed: i64,
    pub success_rate: Decimal,
    /// Last emission before eviction
    pub is_final: bool,
}

impl KpiRow {
    fn from_aggregate(key: WindowKey, agg: &WindowAggregate, is_final: bool) -> Self {
        Self {
            window_start: key.start,
            window_end: key.end,
            revenue: agg.revenue,
            orders_created: agg.orders_created as i64,
            payment_success: agg.payment_success as i64,
            payment_failed: agg.payment_failed as i64,
            success_rate: agg.success_rate(),
            is_final,
        }
    }
}

/// Result of folding one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    Folded(WindowKey),
    /// The window was already past the watermark
    TooLate(WindowKey),
    /// The event time has no representable window
    OutOfRange,
}

/// Rows produced by one [`WindowAggregator::emit`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Emission {
    /// Ordered by window start
    pub rows: Vec<KpiRow>,
    /// Windows finalized and evicted by this call
    pub closed: usize,
}

/// Persisted window entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowEntry {
    #[serde(flatten)]
    pub key: WindowKey,
    #[serde(flatten)]
    pub aggregate: WindowAggregate,
}

/// Persisted window state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    pub windows: Vec<WindowEntry>,
}

/// Sharded tumbling-window aggregator
#[derive(Debug)]
pub struct WindowAggregator {
    size: Duration,
    lateness: Duration,
    shards: Vec<BTreeMap<WindowKey, WindowAggregate>>,
}

impl WindowAggregator {
    pub fn new(size: Duration, lateness: Duration, shards: usize) -> Self {
        Self {
            size,
            lateness,
            shards: vec![BTreeMap::new(); shards.max(1)],
        }
    }

    pub fn size(&self) -> Duration {
        self.size
    }

    /// Fold an event into its window unless the window is already past `watermark`.
    pub fn fold(&mut self, event: &CleanEvent, watermark: Option<DateTime<Utc>>) -> FoldOutcome {
        let Some(key) = WindowKey::containing(event.event.event_time, self.size) else {
            return FoldOutcome::OutOfRange;
        };
        if watermark.is_some_and(|w| key.end <= w) {
            return FoldOutcome::TooLate(key);
        }

        let idx = shard_index(&key.start, self.shards.len());
        self.shards[idx]
            .entry(key)
            .or_default()
            .apply(event.event.event_type, event.event.amount);
        FoldOutcome::Folded(key)
    }

    /// Collect every window with `end <= watermark`, evicting the ones past
    /// their lateness horizon.
    pub fn emit(&mut self, watermark: DateTime<Utc>) -> Emission {
        let mut merged: BTreeMap<WindowKey, WindowAggregate> = BTreeMap::new();
        let mut to_close = Vec::new();

        for shard in &mut self.shards {
            let eligible: Vec<WindowKey> = shard
                .iter()
                .take_while(|(k, _)| k.start < watermark)
                .filter(|(k, _)| k.end <= watermark)
                .map(|(k, _)| *k)
                .collect();

            for key in eligible {
                let closing = key
                    .end
                    .checked_add_signed(self.lateness)
                    .is_some_and(|horizon| horizon <= watermark);
                let agg = if closing {
                    shard.remove(&key)
                } else {
                    shard.get(&key).cloned()
                };
                if let Some(agg) = agg {
                    merged
                        .entry(key)
                        .and_modify(|m| m.merge(&agg))
                        .or_insert(agg);
                    if closing {
                        to_close.push(key);
                    }
                }
            }
        }

        let rows: Vec<KpiRow> = merged
            .iter()
            .map(|(key, agg)| KpiRow::from_aggregate(*key, agg, to_close.contains(key)))
            .collect();

        to_close.sort();
        to_close.dedup();
        let closed = to_close.len();

        if !rows.is_empty() {
            debug!(rows = rows.len(), closed, %watermark, "Emitted window aggregates");
        }

        Emission { rows, closed }
    }

    /// Aggregate currently held for a window, merged across shards.
    pub fn get(&self, key: &WindowKey) -> Option<WindowAggregate> {
        let mut found: Option<WindowAggregate> = None;
        for agg in self.shards.iter().filter_map(|s| s.get(key)) {
            match found.as_mut() {
                Some(f) => f.merge(agg),
                None => found = Some(agg.clone()),
            }
        }
        found
    }

    /// Number of windows held
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> WindowState {
        let mut merged: BTreeMap<WindowKey, WindowAggregate> = BTreeMap::new();
        for (key, agg) in self.shards.iter().flat_map(|s| s.iter()) {
            merged
                .entry(*key)
                .and_modify(|m| m.merge(agg))
                .or_insert_with(|| agg.clone());
        }
        WindowState {
            windows: merged
                .into_iter()
                .map(|(key, aggregate)| WindowEntry { key, aggregate })
                .collect(),
        }
    }

    /// Replace held windows with a persisted state, routing each to its shard.
    pub fn restore(&mut self, state: &WindowState) {
        for shard in &mut self.shards {
            shard.clear();
        }
        let n = self.shards.len();
        for entry in &state.windows {
            self.shards[shard_index(&entry.key.start, n)]
                .entry(entry.key)
                .and_modify(|m| m.merge(&entry.aggregate))
                .or_insert_with(|| entry.aggregate.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    fn clean(id: &str, t: DateTime<Utc>, event_type: EventType, amount: i64) -> CleanEvent {
        CleanEvent::new(
            Event {
                id: id.into(),
                event_time: t,
                event_type,
                order_id: "ORD-1".into(),
                user_id: None,
                amount: Decimal::from(amount),
                currency: None,
                status: None,
            },
            t,
        )
    }

    fn aggregator() -> WindowAggregator {
        WindowAggregator::new(Duration::minutes(1), Duration::minutes(5), 4)
    }

    #[test]
    fn test_window_alignment() {
        let key = WindowKey::containing(at(12, 0, 59), Duration::minutes(1)).unwrap();
        assert_eq!(key.start, at(12, 0, 0));
        assert_eq!(key.end, at(12, 1, 0));

        let edge = WindowKey::containing(at(12, 1, 0), Duration::minutes(1)).unwrap();
        assert_eq!(edge.start, at(12, 1, 0));

        let fractional = at(12, 0, 0) + Duration::nanoseconds(999_999_999);
        assert_eq!(
            WindowKey::containing(fractional, Duration::minutes(1)).unwrap().start,
            at(12, 0, 0)
        );
    }

    #[test]
    fn test_window_at_end_of_time_is_out_of_range() {
        assert!(WindowKey::containing(DateTime::<Utc>::MAX_UTC, Duration::minutes(1)).is_none());

        let mut windows = aggregator();
        let outcome = windows.fold(
            &clean("far", DateTime::<Utc>::MAX_UTC, EventType::OrderCreated, 1),
            None,
        );
        assert_eq!(outcome, FoldOutcome::OutOfRange);
        assert!(windows.is_empty());
    }

    #[test]
    fn test_success_rate() {
        assert_eq!(success_rate(0, 0), Decimal::ZERO);
        assert_eq!(success_rate(2, 1), Decimal::new(6667, 2));
        assert_eq!(success_rate(1, 2), Decimal::new(3333, 2));
        assert_eq!(success_rate(5, 0), Decimal::from(100));
        assert_eq!(success_rate(0, 7), Decimal::ZERO);
        // 3.125 rounds away from zero
        assert_eq!(success_rate(1, 31), Decimal::new(313, 2));
    }

    #[test]
    fn test_success_rate_bounds() {
        for s in 0..25u64 {
            for f in 0..25u64 {
                let rate = success_rate(s, f);
                assert!(rate >= Decimal::ZERO && rate <= Decimal::ONE_HUNDRED);
                assert!(rate.scale() <= 2);
            }
        }
    }

    #[test]
    fn test_payment_window_kpis() {
        let mut windows = aggregator();
        windows.fold(&clean("a", at(12, 0, 5), EventType::PaymentSuccess, 200_000), None);
        windows.fold(&clean("b", at(12, 0, 20), EventType::PaymentSuccess, 300_000), None);
        windows.fold(&clean("c", at(12, 0, 40), EventType::PaymentFailed, 0), None);

        let emission = windows.emit(at(12, 1, 0));
        assert_eq!(emission.rows.len(), 1);
        let row = &emission.rows[0];
        assert_eq!(row.window_start, at(12, 0, 0));
        assert_eq!(row.revenue, Decimal::from(500_000));
        assert_eq!(row.payment_success, 2);
        assert_eq!(row.payment_failed, 1);
        assert_eq!(row.success_rate, Decimal::new(6667, 2));
        assert!(!row.is_final);
    }

    #[test]
    fn test_counts_by_type() {
        let mut agg = WindowAggregate::default();
        agg.apply(EventType::OrderCreated, Decimal::from(100));
        agg.apply(EventType::OrderCreated, Decimal::from(100));
        agg.apply(EventType::PaymentInitiated, Decimal::from(100));
        agg.apply(EventType::OrderCancelled, Decimal::ZERO);
        agg.apply(EventType::PaymentFailed, Decimal::from(100));

        assert_eq!(agg.orders_created, 2);
        assert_eq!(agg.payment_failed, 1);
        assert_eq!(agg.revenue, Decimal::ZERO);
        assert_eq!(agg.events, 5);
    }

    #[test]
    fn test_open_window_not_emitted() {
        let mut windows = aggregator();
        windows.fold(&clean("a", at(12, 0, 30), EventType::OrderCreated, 1), None);
        assert!(windows.emit(at(12, 0, 59)).rows.is_empty());
        assert_eq!(windows.len(), 1);
    }

    #[test]
    fn test_reemitted_until_closed() {
        let mut windows = aggregator();
        windows.fold(&clean("a", at(12, 0, 30), EventType::OrderCreated, 1), None);

        let first = windows.emit(at(12, 2, 0));
        assert_eq!(first.rows.len(), 1);
        assert_eq!(first.closed, 0);

        let again = windows.emit(at(12, 5, 59));
        assert_eq!(again.rows.len(), 1);
        assert!(!again.rows[0].is_final);

        let last = windows.emit(at(12, 6, 0));
        assert_eq!(last.rows.len(), 1);
        assert!(last.rows[0].is_final);
        assert_eq!(last.closed, 1);
        assert!(windows.is_empty());

        let after = windows.emit(at(12, 30, 0));
        assert!(after.rows.is_empty());
        assert_eq!(after.closed, 0);
    }

    #[test]
    fn test_too_late_event_not_folded() {
        let mut windows = aggregator();
        windows.fold(&clean("a", at(12, 0, 30), EventType::OrderCreated, 1), None);
        let before = windows.snapshot();

        let outcome = windows.fold(
            &clean("late", at(12, 0, 10), EventType::PaymentSuccess, 999),
            Some(at(12, 1, 0)),
        );
        assert!(matches!(outcome, FoldOutcome::TooLate(_)));
        assert_eq!(windows.snapshot(), before);

        // a window still ahead of the watermark accepts it
        let outcome = windows.fold(
            &clean("ok", at(12, 1, 10), EventType::PaymentSuccess, 5),
            Some(at(12, 1, 0)),
        );
        assert!(matches!(outcome, FoldOutcome::Folded(_)));
    }

    #[test]
    fn test_emission_ordered_by_window() {
        let mut windows = aggregator();
        for minute in [7, 3, 5, 1, 4] {
            windows.fold(
                &clean(&format!("e{}", minute), at(12, minute, 0), EventType::OrderCreated, 1),
                None,
            );
        }
        let rows = windows.emit(at(12, 10, 0)).rows;
        let starts: Vec<_> = rows.iter().map(|r| r.window_start.format("%M").to_string()).collect();
        assert_eq!(starts, ["01", "03", "04", "05", "07"]);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut windows = aggregator();
        windows.fold(&clean("a", at(12, 0, 5), EventType::PaymentSuccess, 10), None);
        windows.fold(&clean("b", at(12, 3, 5), EventType::OrderCreated, 10), None);
        let state = windows.snapshot();
        assert_eq!(state.windows.len(), 2);

        let mut restored = WindowAggregator::new(Duration::minutes(1), Duration::minutes(5), 2);
        restored.restore(&state);
        assert_eq!(restored.snapshot(), state);

        let key = WindowKey::containing(at(12, 0, 5), Duration::minutes(1)).unwrap();
        assert_eq!(restored.get(&key).map(|a| a.revenue), Some(Decimal::from(10)));
    }

    #[test]
    fn test_state_serializes_flat() {
        let mut windows = aggregator();
        windows.fold(&clean("a", at(12, 0, 5), EventType::PaymentSuccess, 10), None);
        let json = serde_json::to_value(windows.snapshot()).unwrap();
        let entry = &json["windows"][0];
        assert!(entry.get("start").is_some());
        assert!(entry.get("payment_success").is_some());

        let back: WindowState = serde_json::from_value(json).unwrap();
        assert_eq!(back, windows.snapshot());
    }
}
