//! SQL dialect abstraction for orderstream-rdbc
//!
//! Statement generation for the two idempotent write shapes the engine needs:
//! insert-if-absent keyed on the primary key, and upsert keyed on the primary
//! key. Both are built with sea-query; DDL is formatted by hand.

use crate::types::{ColumnMetadata, TableMetadata};
use sea_query::{Alias, Expr, IntoIden, OnConflict, PostgresQueryBuilder, Query, TableRef};

fn sea_table_ref(schema: Option<&str>, table: &str) -> TableRef {
    match schema {
        Some(s) => TableRef::SchemaTable(Alias::new(s).into_iden(), Alias::new(table).into_iden()),
        None => TableRef::Table(Alias::new(table).into_iden()),
    }
}

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for a parameter (e.g., $1)
    fn placeholder(&self, index: usize) -> String;

    /// Get the native type name for a column
    fn native_type(&self, column: &ColumnMetadata) -> String;

    /// Generate `CREATE TABLE IF NOT EXISTS` for the table definition
    fn create_table_sql(&self, table: &TableMetadata) -> String;

    /// Generate an insert that silently skips rows whose key already exists
    fn insert_ignore_sql(&self, table: &TableMetadata, pk_columns: &[&str], columns: &[&str])
        -> String;

    /// Generate an upsert statement that overwrites every non-key column
    fn upsert_sql(&self, table: &TableMetadata, pk_columns: &[&str], columns: &[&str]) -> String;
}

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    fn qualified_table(&self, table: &TableMetadata) -> String {
        match &table.schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(&table.name)
            ),
            None => self.quote_identifier(&table.name),
        }
    }

    fn insert_statement(&self, table: &TableMetadata, columns: &[&str]) -> sea_query::InsertStatement {
        let tbl = sea_table_ref(table.schema.as_deref(), &table.name);
        let col_idens: Vec<_> = columns.iter().map(|c| Alias::new(*c).into_iden()).collect();
        let values: Vec<_> = (1..=columns.len())
            .map(|i| Expr::cust(self.placeholder(i)))
            .collect();

        let mut stmt = Query::insert();
        stmt.into_table(tbl).columns(col_idens).values_panic(values);
        stmt
    }
}

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn native_type(&self, column: &ColumnMetadata) -> String {
        match column.type_name.to_uppercase().as_str() {
            "BOOLEAN" | "BOOL" => "BOOLEAN".to_string(),
            "INTEGER" | "INT" | "INT32" => "INTEGER".to_string(),
            "BIGINT" | "INT64" => "BIGINT".to_string(),
            "DOUBLE PRECISION" | "FLOAT64" | "DOUBLE" => "DOUBLE PRECISION".to_string(),
            "DECIMAL" | "NUMERIC" => match (column.precision, column.scale) {
                (Some(p), Some(s)) => format!("NUMERIC({},{})", p, s),
                (Some(p), None) => format!("NUMERIC({})", p),
                _ => "NUMERIC".to_string(),
            },
            "VARCHAR" | "STRING" | "TEXT" => "TEXT".to_string(),
            "TIMESTAMPTZ" => "TIMESTAMPTZ".to_string(),
            "TIMESTAMP" => "TIMESTAMP".to_string(),
            other => other.to_string(),
        }
    }

    fn create_table_sql(&self, table: &TableMetadata) -> String {
        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|c| {
                let mut def = format!("{} {}", self.quote_identifier(&c.name), self.native_type(c));
                if !c.nullable {
                    def.push_str(" NOT NULL");
                }
                def
            })
            .collect();

        let pk = table.primary_key();
        if !pk.is_empty() {
            let cols: Vec<String> = pk.iter().map(|c| self.quote_identifier(c)).collect();
            parts.push(format!("PRIMARY KEY ({})", cols.join(", ")));
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.qualified_table(table),
            parts.join(", ")
        )
    }

    fn insert_ignore_sql(
        &self,
        table: &TableMetadata,
        pk_columns: &[&str],
        columns: &[&str],
    ) -> String {
        let pk_idens: Vec<_> = pk_columns
            .iter()
            .map(|c| Alias::new(*c).into_iden())
            .collect();

        let mut on_conflict = OnConflict::columns(pk_idens);
        on_conflict.do_nothing();

        let mut stmt = self.insert_statement(table, columns);
        stmt.on_conflict(on_conflict.to_owned());
        stmt.to_string(PostgresQueryBuilder)
    }

    fn upsert_sql(&self, table: &TableMetadata, pk_columns: &[&str], columns: &[&str]) -> String {
        let update_cols: Vec<_> = columns
            .iter()
            .filter(|c| !pk_columns.contains(c))
            .map(|c| Alias::new(*c).into_iden())
            .collect();
        let pk_idens: Vec<_> = pk_columns
            .iter()
            .map(|c| Alias::new(*c).into_iden())
            .collect();

        let mut on_conflict = OnConflict::columns(pk_idens);
        on_conflict.update_columns(update_cols);

        let mut stmt = self.insert_statement(table, columns);
        stmt.on_conflict(on_conflict.to_owned());
        stmt.to_string(PostgresQueryBuilder)
    }
}
