//! Error types for orderstream-rdbc
//!
//! Every sink statement is idempotent, so the only question a caller asks of
//! a failure is whether replaying the whole batch can succeed. Errors are
//! grouped by that answer: an unreachable server, a lock conflict or a
//! timeout clears up on its own; rejected rows and a missing table do not.

use std::fmt;
use thiserror::Error;

/// Result type for orderstream-rdbc operations
pub type Result<T> = std::result::Result<T, Error>;

/// How a failure relates to replaying the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Server unreachable, refusing sessions, or the session dropped
    Unavailable,
    /// Transaction aborted by the server to resolve a lock conflict
    Conflict,
    /// Connect or statement ran past its deadline
    Timeout,
    /// The server refused the row values
    Rejected,
    /// Target table, column or schema does not exist
    Schema,
    /// Any other statement failure (syntax, permissions)
    Statement,
    /// Connection settings cannot be used
    Configuration,
}

impl ErrorCategory {
    /// Whether replaying the same batch later can succeed
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Unavailable | Self::Conflict | Self::Timeout)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "unavailable"),
            Self::Conflict => write!(f, "conflict"),
            Self::Timeout => write!(f, "timeout"),
            Self::Rejected => write!(f, "rejected"),
            Self::Schema => write!(f, "schema"),
            Self::Statement => write!(f, "statement"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

/// Main error type for orderstream-rdbc
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// The database could not be reached or the session ended mid-write.
    ///
    /// A COMMIT that fails this way may or may not have applied; replaying
    /// the idempotent batch settles it either way.
    #[error("database unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Deadlock or serialization failure; nothing was applied
    #[error("write conflict ({sqlstate}): {message}")]
    Conflict { sqlstate: String, message: String },

    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Constraint violation or data exception on a row
    #[error("row rejected ({sqlstate}): {message}")]
    Rejected {
        sqlstate: String,
        constraint: Option<String>,
        message: String,
    },

    #[error("schema error ({sqlstate}): {message}")]
    Schema { sqlstate: String, message: String },

    #[error("statement failed ({sqlstate}): {message}")]
    Statement {
        sqlstate: String,
        message: String,
        sql: String,
    },

    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl Error {
    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unavailable { .. } => ErrorCategory::Unavailable,
            Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Rejected { .. } => ErrorCategory::Rejected,
            Self::Schema { .. } => ErrorCategory::Schema,
            Self::Statement { .. } => ErrorCategory::Statement,
            Self::Configuration { .. } => ErrorCategory::Configuration,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// SQLSTATE reported by the server, if any
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Conflict { sqlstate, .. }
            | Self::Rejected { sqlstate, .. }
            | Self::Schema { sqlstate, .. }
            | Self::Statement { sqlstate, .. } => Some(sqlstate),
            _ => None,
        }
    }

    /// Classify a server error by its SQLSTATE.
    ///
    /// `constraint` is the violated constraint's name when the server
    /// reported one; `sql` is the statement that failed.
    pub fn from_sqlstate(
        sqlstate: &str,
        message: impl Into<String>,
        constraint: Option<&str>,
        sql: &str,
    ) -> Self {
        let message = message.into();
        let sqlstate_owned = sqlstate.to_string();
        match sqlstate {
            // serialization_failure, deadlock_detected
            "40001" | "40P01" => Self::Conflict {
                sqlstate: sqlstate_owned,
                message,
            },
            // admin/crash shutdown, cannot_connect_now, too_many_connections
            "57P01" | "57P02" | "57P03" | "53300" => Self::unavailable(message),
            s if s.starts_with("08") => Self::unavailable(message),
            // query_canceled, raised by statement_timeout
            "57014" => Self::timeout(message),
            s if s.starts_with("23") || s.starts_with("22") => Self::Rejected {
                sqlstate: sqlstate_owned,
                constraint: constraint.map(str::to_string),
                message,
            },
            // undefined_table, undefined_column, invalid_schema_name
            "42P01" | "42703" | "3F000" => Self::Schema {
                sqlstate: sqlstate_owned,
                message,
            },
            _ => Self::Statement {
                sqlstate: sqlstate_owned,
                message,
                sql: sql.to_string(),
            },
        }
    }

    /// Server unreachable or session lost
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    /// [`Error::unavailable`] keeping the driver error
    pub fn unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Deadline exceeded
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// A row refused without a server-side SQLSTATE
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            sqlstate: "22000".to_string(),
            constraint: None,
            message: message.into(),
        }
    }

    /// Unusable connection settings
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_categories_retry() {
        assert!(ErrorCategory::Unavailable.is_retriable());
        assert!(ErrorCategory::Conflict.is_retriable());
        assert!(ErrorCategory::Timeout.is_retriable());

        assert!(!ErrorCategory::Rejected.is_retriable());
        assert!(!ErrorCategory::Schema.is_retriable());
        assert!(!ErrorCategory::Statement.is_retriable());
        assert!(!ErrorCategory::Configuration.is_retriable());
    }

    #[test]
    fn test_statement_error_keeps_sql() {
        let err = Error::from_sqlstate(
            "42601",
            "syntax error at or near \"VALUS\"",
            None,
            "INSERT INTO kpi_1m VALUS ($1)",
        );
        assert!(err.to_string().contains("42601"));
        match err {
            Error::Statement { sql, .. } => assert_eq!(sql, "INSERT INTO kpi_1m VALUS ($1)"),
            other => panic!("expected statement error, got {other:?}"),
        }
    }
}
