//! # Event Deduplication
//!
//! Exact, id-keyed deduplication bounded by event time.
//!
//! ## Retention
//!
//! An id is remembered from the moment it is admitted until the watermark
//! passes `insertion + retention`, where `insertion` is the store's
//! event-time clock at admission (the later of the event's own timestamp and
//! the newest timestamp admitted so far). Once purged, a re-delivered id is
//! indistinguishable from a new event and is admitted again: the store gives
//! exactly-once only within the horizon.
//!
//! ## Sharding
//!
//! Keys are spread over shards by hash of the id, so the same id always lands
//! in the same shard and no cross-shard lookup is ever needed.
//!
//! ## Usage
//!
//! ```ignore
//! let mut dedup = DedupStore::new(DedupConfig::new(Duration::minutes(5)));
//! if dedup.admit(&event) {
//!     emit(event);
//! }
//! dedup.purge(watermark);
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::event::Event;
use crate::types::shard_index;

/// Configuration for the deduplication store.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long (in event time) an id is held after admission
    pub retention: Duration,
    /// Number of state shards
    pub shards: usize,
}

impl DedupConfig {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            shards: 1,
        }
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self::new(Duration::minutes(5))
    }
}

/// One remembered id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub id: String,
    pub expires_at: DateTime<Utc>,
}

/// Persisted dedup state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupState {
    pub clock: Option<DateTime<Utc>>,
    pub entries: Vec<DedupEntry>,
}

#[derive(Debug, Default)]
struct DedupShard {
    /// id -> expiry
    seen: HashMap<String, DateTime<Utc>>,
    /// Expiry index for ordered purging
    by_expiry: BTreeSet<(DateTime<Utc>, String)>,
}

impl DedupShard {
    fn insert(&mut self, id: String, expires_at: DateTime<Utc>) {
        self.by_expiry.insert((expires_at, id.clone()));
        self.seen.insert(id, expires_at);
    }

    fn purge_before(&mut self, watermark: DateTime<Utc>) -> usize {
        let mut purged = 0;
        while let Some((expires_at, _)) = self.by_expiry.first() {
            if *expires_at >= watermark {
                break;
            }
            if let Some((_, id)) = self.by_expiry.pop_first() {
                self.seen.remove(&id);
                purged += 1;
            }
        }
        purged
    }
}

/// Sharded, watermark-evicted set of admitted event ids
#[derive(Debug)]
pub struct DedupStore {
    config: DedupConfig,
    shards: Vec<DedupShard>,
    clock: Option<DateTime<Utc>>,
}

impl DedupStore {
    pub fn new(config: DedupConfig) -> Self {
        let shards = (0..config.shards.max(1))
            .map(|_| DedupShard::default())
            .collect();
        Self {
            config,
            shards,
            clock: None,
        }
    }

    /// Admit an event the first time its id is seen.
    ///
    /// Returns `false` for an id already held by the store.
    pub fn admit(&mut self, event: &Event) -> bool {
        let clock = match self.clock {
            Some(c) => c.max(event.event_time),
            None => event.event_time,
        };
        self.clock = Some(clock);

        let idx = shard_index(event.id.as_str(), self.shards.len());
        let shard = &mut self.shards[idx];
        if shard.seen.contains_key(&event.id) {
            return false;
        }

        let expires_at = clock
            .checked_add_signed(self.config.retention)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        shard.insert(event.id.clone(), expires_at);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shards[shard_index(id, self.shards.len())]
            .seen
            .contains_key(id)
    }

    /// Forget every id whose expiry the watermark has passed.
    pub fn purge(&mut self, watermark: DateTime<Utc>) -> usize {
        let purged: usize = self
            .shards
            .iter_mut()
            .map(|s| s.purge_before(watermark))
            .sum();

        if purged > 0 {
            debug!(purged, remaining = self.len(), %watermark, "Purged expired dedup keys");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.seen.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Export held ids ordered by expiry.
    pub fn snapshot(&self) -> DedupState {
        let mut entries: Vec<DedupEntry> = self
            .shards
            .iter()
            .flat_map(|s| s.by_expiry.iter())
            .map(|(expires_at, id)| DedupEntry {
                id: id.clone(),
                expires_at: *expires_at,
            })
            .collect();
        entries.sort_by(|a, b| (a.expires_at, &a.id).cmp(&(b.expires_at, &b.id)));

        DedupState {
            clock: self.clock,
            entries,
        }
    }

    /// Replace held ids with a persisted state, routing each to its shard.
    pub fn restore(&mut self, state: &DedupState) {
        for shard in &mut self.shards {
            *shard = DedupShard::default();
        }
        let n = self.shards.len();
        for entry in &state.entries {
            self.shards[shard_index(entry.id.as_str(), n)].insert(entry.id.clone(), entry.expires_at);
        }
        self.clock = state.clock;
    }
}
