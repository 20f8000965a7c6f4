//! orderstream - stateful stream engine for e-commerce order and payment events
//!
//! Consumes raw JSON events from a Kafka topic and produces two idempotent
//! outputs in PostgreSQL: a deduplicated table of clean events and a table
//! of per-minute KPIs (revenue, orders created, payment success rate).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌───────┐   ┌──────────┐   ┌──────────────┐
//! │  Reader  │──▶│ Validator │──▶│ Dedup │──▶│ Windows  │──▶│ Sink writer  │
//! │ (kafka)  │   │           │   │       │   │ (1 min)  │   │ events / kpi │
//! └──────────┘   └───────────┘   └───────┘   └──────────┘   └──────┬───────┘
//!       ▲                   watermark drives emit/evict            │
//!       └────────────────── checkpoint (offsets + state) ◀─────────┘
//! ```
//!
//! Delivery is effectively-once: a checkpoint is committed only after both
//! tables were written, and both writes are idempotent, so replaying an
//! uncommitted batch after a crash converges on the same rows.
//!
//! # Usage
//!
//! ```bash
//! # Run the pipeline
//! orderstream -c orderstream.yaml
//!
//! # Validate configuration
//! orderstream -c orderstream.yaml validate
//!
//! # Probe broker and database
//! orderstream check
//!
//! # Inspect the committed checkpoint
//! orderstream checkpoint
//! ```

pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod source;
pub mod types;
pub mod validate;
pub mod watermark;
pub mod window;

pub use checkpoint::{Checkpoint, CheckpointBackend, CheckpointManager, FileCheckpointStore};
pub use config::OrderStreamConfig;
pub use engine::{BatchOutput, BatchStats, EngineConfig, EngineState, StreamEngine};
pub use error::{ErrorCategory, Result, StreamError};
pub use event::{CleanEvent, Event, EventType};
pub use pipeline::{BatchOutcome, Pipeline, PipelineSettings};
pub use sink::{SinkWriter, StreamSink};
pub use source::{Positions, RawRecord, RecordReader};
pub use window::KpiRow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::checkpoint::{
        Checkpoint, CheckpointBackend, CheckpointManager, FileCheckpointStore,
        MemoryCheckpointStore, SharedCheckpointBackend,
    };
    pub use crate::config::{ConfigOverrides, OrderStreamConfig};
    pub use crate::engine::{BatchOutput, BatchStats, EngineConfig, EngineState, StreamEngine};
    pub use crate::error::{Result, StreamError};
    pub use crate::event::{CleanEvent, Event, EventType};
    pub use crate::metrics::{PipelineMetrics, SharedMetrics};
    pub use crate::pipeline::{BatchOutcome, Pipeline, PipelineSettings};
    pub use crate::retry::RetryPolicy;
    pub use crate::sink::{MemorySink, RdbcSink, SinkWriter, StreamSink};
    pub use crate::source::kafka::{KafkaReader, KafkaReaderConfig, StartOffset};
    pub use crate::source::memory::{MemoryReader, MemoryTopic};
    pub use crate::source::{Positions, RawRecord, RecordReader};
    pub use crate::window::{KpiRow, WindowKey};
}
