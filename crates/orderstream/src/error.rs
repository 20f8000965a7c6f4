//! Error types for the orderstream engine
//!
//! Record-level problems (malformed JSON, missing fields, negative amounts)
//! are not errors: they surface as [`RejectionReason`](crate::validate::RejectionReason)
//! and the engine keeps going. Everything here is a failure of the pipeline
//! itself, classified so the runner knows whether to back off, retry the
//! batch, or stop.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Broker or sink unreachable or timed out
    Transport,
    /// Checkpoint or engine state unreadable or unwritable
    State,
    /// Sink rejected a write
    Sink,
    /// Invalid settings
    Configuration,
    /// Serialization errors (JSON)
    Serialization,
}

/// Engine errors
#[derive(Error, Debug)]
pub enum StreamError {
    /// Broker or sink unreachable
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Checkpoint or state store corrupt or unavailable
    #[error("State error: {0}")]
    State(String),

    /// Committed offsets are no longer retained by the broker
    #[error("Data loss on partition {partition}: offsets {lost_from}..{resume_at} are gone")]
    DataLoss {
        partition: i32,
        lost_from: i64,
        resume_at: i64,
    },

    /// A sink write failed
    #[error("Sink write error on {table}: {message}")]
    SinkWrite {
        table: String,
        message: String,
        retriable: bool,
    },

    /// A sink write kept failing until the retry budget ran out
    #[error("Sink write to {table} failed after {attempts} attempts: {message}")]
    SinkExhausted {
        table: String,
        attempts: u32,
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database driver error
    #[error("Database error: {0}")]
    Database(#[from] orderstream_rdbc::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StreamError {
    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a state error.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a retriable sink write error.
    pub fn sink_write(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkWrite {
            table: table.into(),
            message: message.into(),
            retriable: true,
        }
    }

    /// Create a sink write error that retrying will not fix.
    pub fn sink_rejected(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkWrite {
            table: table.into(),
            message: message.into(),
            retriable: false,
        }
    }

    /// Check if this error is worth retrying.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) | Self::Io(_) => true,
            Self::SinkWrite { retriable, .. } => *retriable,
            Self::Database(e) => e.is_retriable(),
            Self::State(_)
            | Self::DataLoss { .. }
            | Self::SinkExhausted { .. }
            | Self::Config(_)
            | Self::Json(_) => false,
        }
    }

    /// Check if this error must stop the process.
    ///
    /// State corruption, untolerated data loss and an exhausted sink write
    /// qualify: continuing past any of them would let the checkpoint and
    /// the sink disagree.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::State(_) | Self::DataLoss { .. } | Self::SinkExhausted { .. }
        )
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_) | Self::Timeout(_) => ErrorCategory::Transport,
            Self::State(_) | Self::DataLoss { .. } | Self::Io(_) => ErrorCategory::State,
            Self::SinkWrite { .. } | Self::SinkExhausted { .. } | Self::Database(_) => {
                ErrorCategory::Sink
            }
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Json(_) => ErrorCategory::Serialization,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::Timeout(_) => "timeout",
            Self::State(_) => "state_error",
            Self::DataLoss { .. } => "data_loss",
            Self::SinkWrite { .. } => "sink_write_error",
            Self::SinkExhausted { .. } => "sink_retries_exhausted",
            Self::Config(_) => "config_error",
            Self::Database(_) => "database_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, StreamError>;
