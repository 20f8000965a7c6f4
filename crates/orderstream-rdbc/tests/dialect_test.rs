//! Unit tests for orderstream-rdbc dialect module

use orderstream_rdbc::dialect::{PostgresDialect, SqlDialect};
use orderstream_rdbc::types::{ColumnMetadata, TableMetadata};

fn kpi_table() -> TableMetadata {
    TableMetadata::new("kpi_1m")
        .with_column(ColumnMetadata::new("window_start", "TIMESTAMPTZ").primary_key(1))
        .with_column(ColumnMetadata::new("window_end", "TIMESTAMPTZ").primary_key(2))
        .with_column(ColumnMetadata::new("revenue", "NUMERIC").not_null())
        .with_column(ColumnMetadata::new("orders_created", "BIGINT").not_null())
        .with_column(ColumnMetadata::new("success_rate", "NUMERIC").with_precision(5, 2))
}

#[test]
fn test_postgres_quote_identifier() {
    let dialect = PostgresDialect;

    assert_eq!(dialect.quote_identifier("events_clean"), "\"events_clean\"");
    // embedded quotes are doubled
    assert_eq!(dialect.quote_identifier("my\"table"), "\"my\"\"table\"");
}

#[test]
fn test_postgres_placeholder() {
    let dialect = PostgresDialect;

    assert_eq!(dialect.placeholder(1), "$1");
    assert_eq!(dialect.placeholder(9), "$9");
    assert_eq!(dialect.placeholder(10), "$10");
}

#[test]
fn test_postgres_native_types() {
    let dialect = PostgresDialect;

    assert_eq!(
        dialect.native_type(&ColumnMetadata::new("id", "STRING")),
        "TEXT"
    );
    assert_eq!(
        dialect.native_type(&ColumnMetadata::new("amount", "DECIMAL")),
        "NUMERIC"
    );
    assert_eq!(
        dialect.native_type(&ColumnMetadata::new("rate", "DECIMAL").with_precision(5, 2)),
        "NUMERIC(5,2)"
    );
    assert_eq!(
        dialect.native_type(&ColumnMetadata::new("n", "INT64")),
        "BIGINT"
    );
}

// ============================================================================
// Idempotent write statements
// ============================================================================

#[test]
fn test_postgres_insert_ignore_sql() {
    let dialect = PostgresDialect;
    let table = TableMetadata::new("events_clean");

    let sql = dialect.insert_ignore_sql(&table, &["id"], &["id", "event_time", "amount"]);

    assert!(sql.starts_with("INSERT INTO \"events_clean\""));
    assert!(sql.contains("$1"));
    assert!(sql.contains("$3"));
    assert!(sql.contains("ON CONFLICT (\"id\") DO NOTHING"));
    assert!(!sql.contains("DO UPDATE"));
}

#[test]
fn test_postgres_upsert_sql() {
    let dialect = PostgresDialect;
    let table = kpi_table();

    let sql = dialect.upsert_sql(
        &table,
        &["window_start", "window_end"],
        &["window_start", "window_end", "revenue", "orders_created"],
    );

    assert!(sql.contains("INSERT INTO"));
    assert!(sql.contains("ON CONFLICT (\"window_start\", \"window_end\")"));
    assert!(sql.contains("DO UPDATE SET"));
    assert!(sql.contains("\"revenue\" = \"excluded\".\"revenue\""));
    // key columns are never rewritten
    assert!(!sql.contains("\"window_start\" = \"excluded\""));
}

#[test]
fn test_postgres_upsert_sql_with_schema() {
    let dialect = PostgresDialect;
    let table = kpi_table().with_schema(Some("analytics".into()));

    let sql = dialect.upsert_sql(&table, &["window_start", "window_end"], &table.column_names());

    assert!(sql.contains("\"analytics\".\"kpi_1m\""));
}

// ============================================================================
// DDL
// ============================================================================

#[test]
fn test_postgres_create_table_sql() {
    let dialect = PostgresDialect;
    let sql = dialect.create_table_sql(&kpi_table());

    assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"kpi_1m\" ("));
    assert!(sql.contains("\"window_start\" TIMESTAMPTZ NOT NULL"));
    assert!(sql.contains("\"success_rate\" NUMERIC(5,2)"));
    assert!(!sql.contains("\"success_rate\" NUMERIC(5,2) NOT NULL"));
    assert!(sql.contains("PRIMARY KEY (\"window_start\", \"window_end\")"));
}

#[test]
fn test_create_table_without_primary_key() {
    let dialect = PostgresDialect;
    let table = TableMetadata::new("audit").with_column(ColumnMetadata::new("note", "TEXT"));

    let sql = dialect.create_table_sql(&table);

    assert_eq!(sql, "CREATE TABLE IF NOT EXISTS \"audit\" (\"note\" TEXT)");
}
