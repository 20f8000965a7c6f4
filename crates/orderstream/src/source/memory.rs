//! In-memory topic and reader
//!
//! A [`MemoryTopic`] is an append-only, partitioned log that tests and
//! dry runs produce into; a [`MemoryReader`] consumes it with the same
//! position semantics as the Kafka reader.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::kafka::{resume_after_data_loss, StartOffset};
use super::{Positions, RawRecord, RecordReader};
use crate::error::{Result, StreamError};
use crate::event::Event;
use crate::types::shard_index;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
}

/// Shared, partitioned append-only log
#[derive(Debug, Clone)]
pub struct MemoryTopic {
    name: String,
    partitions: Arc<Mutex<BTreeMap<i32, Vec<StoredRecord>>>>,
    /// First retained offset per partition
    log_start: Arc<Mutex<Positions>>,
}

impl MemoryTopic {
    pub fn new(name: impl Into<String>, partitions: i32) -> Self {
        let logs = (0..partitions.max(1)).map(|p| (p, Vec::new())).collect();
        Self {
            name: name.into(),
            partitions: Arc::new(Mutex::new(logs)),
            log_start: Arc::new(Mutex::new(Positions::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.lock().len()
    }

    /// Append a raw payload, returning its offset.
    pub fn produce(&self, partition: i32, key: Option<&[u8]>, payload: Option<&[u8]>) -> i64 {
        let mut partitions = self.partitions.lock();
        let log = partitions.entry(partition).or_default();
        log.push(StoredRecord {
            key: key.map(<[u8]>::to_vec),
            payload: payload.map(<[u8]>::to_vec),
        });
        log.len() as i64 - 1
    }

    /// Append an event keyed by its order id, on the partition the key hashes to.
    pub fn produce_event(&self, event: &Event) -> (i32, i64) {
        let partition = shard_index(event.partition_key(), self.partition_count()) as i32;
        let payload = event.to_json().to_string();
        let offset = self.produce(
            partition,
            Some(event.partition_key().as_bytes()),
            Some(payload.as_bytes()),
        );
        (partition, offset)
    }

    /// Drop every record of `partition` before `offset`, as retention would.
    pub fn truncate_before(&self, partition: i32, offset: i64) {
        let mut starts = self.log_start.lock();
        let start = starts.entry(partition).or_insert(0);
        *start = (*start).max(offset);
    }

    fn start_offset(&self, partition: i32) -> i64 {
        self.log_start.lock().get(&partition).copied().unwrap_or(0)
    }

    /// Offset the next append to `partition` will get
    pub fn end_offset(&self, partition: i32) -> i64 {
        self.partitions
            .lock()
            .get(&partition)
            .map_or(0, |log| log.len() as i64)
    }

    fn end_offsets(&self) -> Positions {
        self.partitions
            .lock()
            .iter()
            .map(|(p, log)| (*p, log.len() as i64))
            .collect()
    }
}

/// [`RecordReader`] over a [`MemoryTopic`]
pub struct MemoryReader {
    topic: MemoryTopic,
    positions: Positions,
    fail_on_data_loss: bool,
    fail_polls: u32,
    fail_polls_after_read: u32,
}

impl MemoryReader {
    pub fn new(topic: MemoryTopic) -> Self {
        Self::with_start(topic, StartOffset::Earliest)
    }

    pub fn with_start(topic: MemoryTopic, start: StartOffset) -> Self {
        let positions = match start {
            StartOffset::Earliest => topic.end_offsets().into_keys().map(|p| (p, 0)).collect(),
            StartOffset::Latest => topic.end_offsets(),
        };
        Self {
            topic,
            positions,
            fail_on_data_loss: false,
            fail_polls: 0,
            fail_polls_after_read: 0,
        }
    }

    pub fn with_fail_on_data_loss(mut self, fail: bool) -> Self {
        self.fail_on_data_loss = fail;
        self
    }

    /// Make the next `n` polls fail with a transport error.
    pub fn fail_next_polls(&mut self, n: u32) {
        self.fail_polls = n;
    }

    /// Make the next `n` polls read and move positions forward, then fail
    /// with a transport error, like a fetch that broke on a later partition.
    pub fn fail_next_polls_after_read(&mut self, n: u32) {
        self.fail_polls_after_read = n;
    }
}

#[async_trait]
impl RecordReader for MemoryReader {
    async fn poll(&mut self, max_records: usize) -> Result<Vec<RawRecord>> {
        if self.fail_polls > 0 {
            self.fail_polls -= 1;
            return Err(StreamError::transport(format!(
                "topic {} unavailable",
                self.topic.name
            )));
        }

        let mut resumed = Positions::new();
        for (partition, next) in &self.positions {
            let start = self.topic.start_offset(*partition);
            if *next < start {
                let resume_at =
                    resume_after_data_loss(*partition, *next, start, self.fail_on_data_loss)?;
                resumed.insert(*partition, resume_at);
            }
        }
        self.positions.extend(resumed);

        let mut batch = Vec::new();
        {
            let partitions = self.topic.partitions.lock();
            for (partition, log) in partitions.iter() {
                let next = self.positions.entry(*partition).or_insert(0);
                while batch.len() < max_records {
                    let Some(stored) = usize::try_from(*next).ok().and_then(|i| log.get(i))
                    else {
                        break;
                    };
                    batch.push(RawRecord {
                        partition: *partition,
                        offset: *next,
                        key: stored.key.clone(),
                        payload: stored.payload.clone(),
                        timestamp: Some(Utc::now()),
                    });
                    *next += 1;
                }
            }
        }

        if self.fail_polls_after_read > 0 {
            self.fail_polls_after_read -= 1;
            return Err(StreamError::transport(format!(
                "topic {} fetch interrupted",
                self.topic.name
            )));
        }
        Ok(batch)
    }

    fn positions(&self) -> Positions {
        self.positions.clone()
    }

    async fn seek(&mut self, positions: &Positions) -> Result<()> {
        for (partition, offset) in positions {
            self.positions.insert(*partition, *offset);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.topic.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_advances_positions() {
        let topic = MemoryTopic::new("events_raw", 2);
        topic.produce(0, None, Some(b"a"));
        topic.produce(0, None, Some(b"b"));
        topic.produce(1, None, Some(b"c"));

        let mut reader = MemoryReader::new(topic.clone());
        let first = reader.poll(2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(reader.positions(), Positions::from([(0, 2), (1, 0)]));

        let second = reader.poll(10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].partition, 1);
        assert!(reader.poll(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_seek_replays() {
        let topic = MemoryTopic::new("events_raw", 1);
        for i in 0..5u8 {
            topic.produce(0, None, Some(&[i]));
        }
        let mut reader = MemoryReader::new(topic);
        reader.poll(5).await.unwrap();

        reader.seek(&Positions::from([(0, 3)])).await.unwrap();
        let replay = reader.poll(5).await.unwrap();
        assert_eq!(replay.iter().map(|r| r.offset).collect::<Vec<_>>(), [3, 4]);
    }

    #[tokio::test]
    async fn test_latest_skips_existing() {
        let topic = MemoryTopic::new("events_raw", 1);
        topic.produce(0, None, Some(b"old"));
        let mut reader = MemoryReader::with_start(topic.clone(), StartOffset::Latest);
        assert!(reader.poll(10).await.unwrap().is_empty());

        topic.produce(0, None, Some(b"new"));
        let batch = reader.poll(10).await.unwrap();
        assert_eq!(batch[0].payload.as_deref(), Some(&b"new"[..]));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let mut reader = MemoryReader::new(MemoryTopic::new("events_raw", 1));
        reader.fail_next_polls(1);
        assert!(reader.poll(1).await.unwrap_err().is_retriable());
        assert!(reader.poll(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_truncated_log_skips_ahead() {
        let topic = MemoryTopic::new("events_raw", 1);
        for i in 0..4u8 {
            topic.produce(0, None, Some(&[i]));
        }
        topic.truncate_before(0, 3);

        let mut reader = MemoryReader::new(topic);
        let batch = reader.poll(10).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), [3]);
        assert_eq!(reader.positions(), Positions::from([(0, 4)]));
    }

    #[tokio::test]
    async fn test_truncated_log_fails_when_loss_not_tolerated() {
        let topic = MemoryTopic::new("events_raw", 1);
        topic.produce(0, None, Some(b"a"));
        topic.produce(0, None, Some(b"b"));
        topic.truncate_before(0, 1);

        let mut reader = MemoryReader::new(topic).with_fail_on_data_loss(true);
        let err = reader.poll(10).await.unwrap_err();
        assert!(matches!(err, StreamError::DataLoss { partition: 0, lost_from: 0, resume_at: 1 }));
        assert_eq!(reader.positions(), Positions::from([(0, 0)]));
    }
}
