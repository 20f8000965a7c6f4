//! Statement parameters and table layouts

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// A statement parameter
///
/// Covers exactly the column types of the two sink tables. NULL is only
/// ever bound to a textual column.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// BIGINT
    Int64(i64),
    /// NUMERIC
    Decimal(Decimal),
    /// TEXT
    String(String),
    /// TIMESTAMPTZ
    DateTimeTz(DateTime<Utc>),
}

impl Value {
    /// Whether this is SQL NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Text content, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Numeric content, if this is a decimal
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Decimal(d) => Some(*d),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}

/// Column definition used for DDL and statement generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    /// Column name
    pub name: String,
    /// Logical type name (mapped to a native type by the dialect)
    pub type_name: String,
    /// Whether column is nullable
    pub nullable: bool,
    /// Primary key ordinal (1-based, None if not PK)
    pub primary_key_ordinal: Option<u32>,
    /// Precision for numeric types
    pub precision: Option<u32>,
    /// Scale for numeric types
    pub scale: Option<u32>,
}

impl ColumnMetadata {
    /// Create a nullable column with the given logical type
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable: true,
            primary_key_ordinal: None,
            precision: None,
            scale: None,
        }
    }

    /// Mark the column NOT NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Make the column part of the primary key
    pub fn primary_key(mut self, ordinal: u32) -> Self {
        self.primary_key_ordinal = Some(ordinal);
        self.nullable = false;
        self
    }

    /// Set numeric precision and scale
    pub fn with_precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }
}

/// Table definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    /// Schema (None means the search path default)
    pub schema: Option<String>,
    /// Table name
    pub name: String,
    /// Column metadata (in ordinal order)
    pub columns: Vec<ColumnMetadata>,
}

impl TableMetadata {
    /// Create new table metadata
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Set the schema
    pub fn with_schema(mut self, schema: Option<String>) -> Self {
        self.schema = schema;
        self
    }

    /// Append a column
    pub fn with_column(mut self, column: ColumnMetadata) -> Self {
        self.columns.push(column);
        self
    }

    /// Get fully qualified name
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(s) => format!("{}.{}", s, self.name),
            None => self.name.clone(),
        }
    }

    /// Column names in ordinal order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Primary key column names ordered by key ordinal
    pub fn primary_key(&self) -> Vec<&str> {
        let mut pk: Vec<&ColumnMetadata> = self
            .columns
            .iter()
            .filter(|c| c.primary_key_ordinal.is_some())
            .collect();
        pk.sort_by_key(|c| c.primary_key_ordinal);
        pk.into_iter().map(|c| c.name.as_str()).collect()
    }
}
