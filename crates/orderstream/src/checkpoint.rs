//! # Checkpointing
//!
//! A checkpoint pairs the next broker offset per partition with the engine
//! state (watermark, dedup ids, open windows) as it stood after the batch
//! that produced those offsets. One is committed after each batch whose sink
//! writes succeeded and never before, so on restart the source rewinds to the
//! first uncommitted record and the engine resumes with matching state.
//!
//! ## Storage
//!
//! - **File**: one JSON document per topic, replaced atomically (temp file,
//!   optional fsync, rename)
//! - **Memory**: for tests and dry runs
//!
//! Any failure to read, parse or write a checkpoint is a
//! [`StreamError::State`]: resuming on unknown state risks duplicate or lost
//! output. A save or load that outlives its deadline counts as a failure.
//!
//! ## Usage
//!
//! ```ignore
//! let store = FileCheckpointStore::new("./checkpoints/orderstream").await?;
//! let mut manager = CheckpointManager::new(Arc::new(store), "events_raw");
//! if let Some(cp) = manager.recover().await? {
//!     engine.restore(&cp.state);
//!     reader.seek(&cp.offsets).await?;
//! }
//! // ... process and write a batch ...
//! manager.commit(reader.positions(), engine.snapshot()).await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::engine::EngineState;
use crate::error::{Result, StreamError};
use crate::source::Positions;

/// Format version written into every checkpoint
pub const CHECKPOINT_VERSION: u32 = 1;

/// Deadline for one checkpoint save or load
pub const DEFAULT_CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// Committed progress for one topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    /// Sequence number of the batch that produced this checkpoint
    pub batch_id: u64,
    pub topic: String,
    /// Next offset to read, per partition
    pub offsets: Positions,
    pub created_at: DateTime<Utc>,
    pub state: EngineState,
}

impl Checkpoint {
    pub fn new(batch_id: u64, topic: impl Into<String>, offsets: Positions, state: EngineState) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            batch_id,
            topic: topic.into(),
            offsets,
            created_at: Utc::now(),
            state,
        }
    }
}

/// Trait for checkpoint storage backends.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    async fn save(&self, key: &str, checkpoint: &Checkpoint) -> Result<()>;
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>>;
}

/// Shared checkpoint backend.
pub type SharedCheckpointBackend = Arc<dyn CheckpointBackend>;

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('/') || key.contains('\\') || key.starts_with('.') {
        return Err(StreamError::state(format!("invalid checkpoint key {:?}", key)));
    }
    Ok(())
}

/// Checkpoints as JSON files, one per key.
pub struct FileCheckpointStore {
    base_dir: PathBuf,
    /// Whether to fsync after writes
    fsync: bool,
}

impl FileCheckpointStore {
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await.map_err(|e| {
            StreamError::state(format!(
                "cannot create checkpoint directory {}: {}",
                base_dir.display(),
                e
            ))
        })?;
        Ok(Self { base_dir, fsync })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", key))
    }

    async fn write_atomically(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let temp_path = path.with_extension("json.tmp");

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, path).await
    }
}

#[async_trait]
impl CheckpointBackend for FileCheckpointStore {
    async fn save(&self, key: &str, checkpoint: &Checkpoint) -> Result<()> {
        validate_key(key)?;
        let path = self.file_path(key);
        let json = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| StreamError::state(format!("cannot serialize checkpoint: {}", e)))?;

        self.write_atomically(&path, &json).await.map_err(|e| {
            StreamError::state(format!("cannot write checkpoint {}: {}", path.display(), e))
        })?;

        debug!(path = %path.display(), batch_id = checkpoint.batch_id, "Saved checkpoint");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Checkpoint>> {
        validate_key(key)?;
        let path = self.file_path(key);

        let contents = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StreamError::state(format!(
                    "cannot read checkpoint {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&contents).map_err(|e| {
            StreamError::state(format!("corrupt checkpoint {}: {}", path.display(), e))
        })?;
        Ok(Some(checkpoint))
    }
}

/// In-memory checkpoint store.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    fail_saves: Mutex<bool>,
    save_delay: Mutex<Duration>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following save fail, as an unwritable disk would.
    pub fn set_fail_saves(&self, fail: bool) {
        *self.fail_saves.lock() = fail;
    }

    /// Stall every following save, as a hung disk would.
    pub fn set_save_delay(&self, delay: Duration) {
        *self.save_delay.lock() = delay;
    }

    pub fn get(&self, key: &str) -> Option<Checkpoint> {
        self.checkpoints.lock().get(key).cloned()
    }
}

#[async_trait]
impl CheckpointBackend for MemoryCheckpointStore {
    async fn save(&self, key: &str, checkpoint: &Checkpoint) -> Result<()> {
        validate_key(key)?;
        if *self.fail_saves.lock() {
            return Err(StreamError::state("checkpoint store unavailable"));
        }
        let delay = *self.save_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.checkpoints
            .lock()
            .insert(key.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Checkpoint>> {
        validate_key(key)?;
        Ok(self.get(key))
    }
}

/// Tracks the last committed checkpoint for one topic.
pub struct CheckpointManager {
    backend: SharedCheckpointBackend,
    topic: String,
    timeout: Duration,
    last: Option<Checkpoint>,
}

impl CheckpointManager {
    pub fn new(backend: SharedCheckpointBackend, topic: impl Into<String>) -> Self {
        Self {
            backend,
            topic: topic.into(),
            timeout: DEFAULT_CHECKPOINT_TIMEOUT,
            last: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn bounded<T>(
        &self,
        action: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, fut).await.map_err(|_| {
            StreamError::state(format!(
                "checkpoint {} for {:?} exceeded {}ms",
                action,
                self.topic,
                self.timeout.as_millis()
            ))
        })?
    }

    /// Load the last committed checkpoint, if any.
    pub async fn recover(&mut self) -> Result<Option<Checkpoint>> {
        let loaded = self
            .bounded("load", self.backend.load(&self.topic))
            .await?;

        if let Some(cp) = &loaded {
            if cp.version != CHECKPOINT_VERSION {
                return Err(StreamError::state(format!(
                    "unsupported checkpoint version {} (expected {})",
                    cp.version, CHECKPOINT_VERSION
                )));
            }
            if cp.topic != self.topic {
                return Err(StreamError::state(format!(
                    "checkpoint belongs to topic {:?}, not {:?}",
                    cp.topic, self.topic
                )));
            }
            info!(
                batch_id = cp.batch_id,
                partitions = cp.offsets.len(),
                watermark = ?cp.state.watermark.watermark,
                dedup_keys = cp.state.dedup.entries.len(),
                open_windows = cp.state.windows.windows.len(),
                "Recovered checkpoint"
            );
        } else {
            info!(topic = %self.topic, "No checkpoint found, starting fresh");
        }

        self.last = loaded.clone();
        Ok(loaded)
    }

    /// Durably record a processed batch.
    ///
    /// Only call once every sink write for the batch has succeeded.
    pub async fn commit(&mut self, offsets: Positions, state: EngineState) -> Result<&Checkpoint> {
        let batch_id = self.last.as_ref().map_or(1, |cp| cp.batch_id + 1);
        let checkpoint = Checkpoint::new(batch_id, self.topic.clone(), offsets, state);

        self.bounded("save", self.backend.save(&self.topic, &checkpoint))
            .await?;
        debug!(batch_id, offsets = ?checkpoint.offsets, "Committed checkpoint");

        let committed: &Checkpoint = self.last.insert(checkpoint);
        Ok(committed)
    }

    pub fn last_committed(&self) -> Option<&Checkpoint> {
        self.last.as_ref()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}
