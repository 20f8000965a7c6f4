//! Kafka record reader
//!
//! Reads every partition of one topic with the pure Rust
//! [rskafka](https://crates.io/crates/rskafka) client. There is no consumer
//! group: positions are owned by the pipeline and persisted in checkpoints,
//! and the reader only seeds partitions nobody has committed yet from the
//! configured start offset.
//!
//! Partitions are discovered once when the reader connects.

use async_trait::async_trait;
use futures::future::join_all;
use rskafka::client::error::{Error as KafkaError, ProtocolError};
use rskafka::client::partition::{OffsetAt, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::RecordAndOffset;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Positions, RawRecord, RecordReader};
use crate::error::{Result, StreamError};

/// Where to start partitions that have no committed offset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    Earliest,
    #[default]
    Latest,
}

impl From<StartOffset> for OffsetAt {
    fn from(start: StartOffset) -> Self {
        match start {
            StartOffset::Earliest => OffsetAt::Earliest,
            StartOffset::Latest => OffsetAt::Latest,
        }
    }
}

/// Connection and fetch settings for [`KafkaReader`]
#[derive(Debug, Clone)]
pub struct KafkaReaderConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub start_offset: StartOffset,
    pub connect_timeout: Duration,
    /// Upper bound on bytes per partition fetch
    pub fetch_max_bytes: i32,
    /// How long the broker may hold a fetch open waiting for data
    pub fetch_max_wait: Duration,
    /// Fail instead of skipping ahead when committed offsets were deleted
    pub fail_on_data_loss: bool,
}

impl KafkaReaderConfig {
    pub fn new(brokers: Vec<String>, topic: impl Into<String>) -> Self {
        Self {
            brokers,
            topic: topic.into(),
            start_offset: StartOffset::Latest,
            connect_timeout: Duration::from_secs(30),
            fetch_max_bytes: 1024 * 1024,
            fetch_max_wait: Duration::from_millis(500),
            fail_on_data_loss: false,
        }
    }
}

struct PartitionCursor {
    client: Arc<PartitionClient>,
    next: i64,
}

pub struct KafkaReader {
    config: KafkaReaderConfig,
    partitions: BTreeMap<i32, PartitionCursor>,
}

impl KafkaReader {
    /// Build an rskafka client, bounded by the connect timeout.
    pub async fn create_client(config: &KafkaReaderConfig) -> Result<Client> {
        let builder = ClientBuilder::new(config.brokers.clone());

        tokio::time::timeout(config.connect_timeout, builder.build())
            .await
            .map_err(|_| {
                StreamError::timeout(format!(
                    "connection timeout after {}ms to brokers {:?}",
                    config.connect_timeout.as_millis(),
                    config.brokers
                ))
            })?
            .map_err(|e| StreamError::transport(format!("failed to connect to Kafka: {}", e)))
    }

    /// Partition ids of the configured topic.
    pub async fn discover_partitions(client: &Client, topic: &str) -> Result<Vec<i32>> {
        let topics = client
            .list_topics()
            .await
            .map_err(|e| StreamError::transport(format!("failed to list topics: {}", e)))?;

        topics
            .into_iter()
            .find(|t| t.name == topic)
            .map(|t| t.partitions.into_iter().collect::<Vec<_>>())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| StreamError::transport(format!("topic {:?} not found", topic)))
    }

    /// Connect and position every partition at the configured start offset.
    pub async fn connect(config: KafkaReaderConfig) -> Result<Self> {
        let client = Self::create_client(&config).await?;
        let ids = Self::discover_partitions(&client, &config.topic).await?;

        let mut partitions = BTreeMap::new();
        for id in ids {
            let partition = client
                .partition_client(config.topic.clone(), id, UnknownTopicHandling::Retry)
                .await
                .map_err(|e| {
                    StreamError::transport(format!("partition {} unavailable: {}", id, e))
                })?;
            let next = partition
                .get_offset(config.start_offset.into())
                .await
                .map_err(|e| {
                    StreamError::transport(format!("failed to get offset for partition {}: {}", id, e))
                })?;
            partitions.insert(
                id,
                PartitionCursor {
                    client: Arc::new(partition),
                    next,
                },
            );
        }

        info!(
            topic = %config.topic,
            partitions = partitions.len(),
            start = ?config.start_offset,
            "Kafka reader connected"
        );
        Ok(Self { config, partitions })
    }

    async fn fetch_partition(
        &self,
        id: i32,
        cursor: &PartitionCursor,
    ) -> std::result::Result<Vec<RecordAndOffset>, KafkaError> {
        let max_wait_ms = self.config.fetch_max_wait.as_millis().min(i32::MAX as u128) as i32;
        let (records, _high_watermark) = cursor
            .client
            .fetch_records(cursor.next, 1..self.config.fetch_max_bytes.max(2), max_wait_ms)
            .await?;
        debug!(partition = id, fetched = records.len(), from = cursor.next, "Fetched records");
        Ok(records)
    }

    /// Earliest offset the broker still retains for a partition.
    async fn earliest_offset(&self, id: i32) -> Result<i64> {
        let cursor = self
            .partitions
            .get(&id)
            .ok_or_else(|| StreamError::state(format!("unknown partition {}", id)))?;
        cursor
            .client
            .get_offset(OffsetAt::Earliest)
            .await
            .map_err(|e| {
                StreamError::transport(format!(
                    "failed to get earliest offset for partition {}: {}",
                    id, e
                ))
            })
    }
}

/// Decide where a partition resumes after its position fell off the log.
///
/// Fails with [`StreamError::DataLoss`] when loss is not tolerated.
pub(crate) fn resume_after_data_loss(
    partition: i32,
    lost_from: i64,
    earliest: i64,
    fail_on_data_loss: bool,
) -> Result<i64> {
    if fail_on_data_loss {
        return Err(StreamError::DataLoss {
            partition,
            lost_from,
            resume_at: earliest,
        });
    }
    warn!(
        partition,
        lost_from,
        resume_at = earliest,
        "Offset out of range, resuming from earliest available offset"
    );
    Ok(earliest)
}

#[async_trait]
impl RecordReader for KafkaReader {
    async fn poll(&mut self, max_records: usize) -> Result<Vec<RawRecord>> {
        let deadline = self.config.fetch_max_wait + self.config.connect_timeout;
        let this: &Self = self;
        let fetches = this
            .partitions
            .iter()
            .map(|(id, cursor)| async move { (*id, this.fetch_partition(*id, cursor).await) });

        let results = tokio::time::timeout(deadline, join_all(fetches))
            .await
            .map_err(|_| StreamError::timeout(format!("fetch exceeded {}ms", deadline.as_millis())))?;

        // cursors move only once every partition fetched cleanly
        let mut advanced = Positions::new();
        let mut batch = Vec::new();
        let mut lost = Vec::new();
        for (id, result) in results {
            let records = match result {
                Ok(records) => records,
                Err(KafkaError::ServerError {
                    protocol_error: ProtocolError::OffsetOutOfRange,
                    ..
                }) => {
                    lost.push(id);
                    continue;
                }
                Err(e) => {
                    return Err(StreamError::transport(format!(
                        "fetch failed on partition {}: {}",
                        id, e
                    )))
                }
            };

            let Some(cursor) = self.partitions.get(&id) else {
                continue;
            };
            let mut next = cursor.next;
            for rec in records {
                // compressed batches may start before the requested offset
                if rec.offset < next {
                    continue;
                }
                if batch.len() >= max_records {
                    break;
                }
                next = rec.offset + 1;
                batch.push(RawRecord {
                    partition: id,
                    offset: rec.offset,
                    key: rec.record.key,
                    payload: rec.record.value,
                    timestamp: Some(rec.record.timestamp),
                });
            }
            advanced.insert(id, next);
        }

        for id in lost {
            let lost_from = self.partitions.get(&id).map_or(0, |c| c.next);
            let earliest = self.earliest_offset(id).await?;
            let resume_at =
                resume_after_data_loss(id, lost_from, earliest, self.config.fail_on_data_loss)?;
            advanced.insert(id, resume_at);
        }

        for (id, next) in advanced {
            if let Some(cursor) = self.partitions.get_mut(&id) {
                cursor.next = next;
            }
        }
        Ok(batch)
    }

    fn positions(&self) -> Positions {
        self.partitions
            .iter()
            .map(|(id, cursor)| (*id, cursor.next))
            .collect()
    }

    async fn seek(&mut self, positions: &Positions) -> Result<()> {
        for (id, offset) in positions {
            match self.partitions.get_mut(id) {
                Some(cursor) => cursor.next = *offset,
                None => warn!(partition = id, "Checkpoint names a partition the topic no longer has"),
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("kafka://{}/{}", self.config.brokers.join(","), self.config.topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_offset_serde() {
        let start: StartOffset = serde_json::from_str("\"earliest\"").unwrap();
        assert_eq!(start, StartOffset::Earliest);
        assert_eq!(StartOffset::default(), StartOffset::Latest);
        assert!(matches!(OffsetAt::from(StartOffset::Latest), OffsetAt::Latest));
    }

    #[test]
    fn test_config_defaults() {
        let config = KafkaReaderConfig::new(vec!["kafka:9092".into()], "events_raw");
        assert_eq!(config.start_offset, StartOffset::Latest);
        assert!(!config.fail_on_data_loss);
        assert!(config.fetch_max_bytes > 1);
    }

    #[test]
    fn test_data_loss_skips_ahead_when_tolerated() {
        assert_eq!(resume_after_data_loss(0, 10, 42, false).unwrap(), 42);
    }

    #[test]
    fn test_data_loss_is_fatal_when_not_tolerated() {
        let err = resume_after_data_loss(3, 10, 42, true).unwrap_err();
        assert!(matches!(
            err,
            StreamError::DataLoss {
                partition: 3,
                lost_from: 10,
                resume_at: 42
            }
        ));
        assert!(!err.is_retriable());
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_connect_timeout_on_unroutable_broker() {
        let mut config = KafkaReaderConfig::new(vec!["10.255.255.1:9092".into()], "events_raw");
        config.connect_timeout = Duration::from_millis(50);
        let err = KafkaReader::connect(config).await.err().expect("connect must fail");
        assert!(err.is_retriable());
    }
}
