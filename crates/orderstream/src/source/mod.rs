//! Record readers
//!
//! A reader hands out raw broker records in micro-batches and tracks, per
//! partition, the next offset to read. Positions only move forward through
//! [`RecordReader::poll`]; the pipeline rewinds them with
//! [`RecordReader::seek`] when a batch has to be replayed.

pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::Result;

pub use kafka::KafkaReader;
pub use memory::MemoryReader;

/// Next offset to read, per partition
pub type Positions = BTreeMap<i32, i64>;

/// Opaque broker record
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Broker append time, if the transport carries one
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawRecord {
    pub fn new(partition: i32, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            payload: Some(payload.into()),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }
}

#[async_trait]
pub trait RecordReader: Send {
    /// Fetch up to `max_records` new records.
    ///
    /// Returns an empty batch when nothing arrived before the fetch deadline.
    async fn poll(&mut self, max_records: usize) -> Result<Vec<RawRecord>>;

    /// Current read positions.
    fn positions(&self) -> Positions;

    /// Move read positions; partitions not named keep their position.
    async fn seek(&mut self, positions: &Positions) -> Result<()>;

    /// Short description for logs.
    fn describe(&self) -> String;
}
