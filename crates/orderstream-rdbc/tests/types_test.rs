//! Parameter values and table layouts

use chrono::{TimeZone, Utc};
use orderstream_rdbc::types::{ColumnMetadata, TableMetadata, Value};
use rust_decimal::Decimal;

#[test]
fn test_value_null() {
    let v = Value::Null;
    assert!(v.is_null());
    assert_eq!(v.as_str(), None);
    assert_eq!(v.as_decimal(), None);
}

#[test]
fn test_value_from_option() {
    let none: Option<String> = None;
    assert_eq!(Value::from(none), Value::Null);
    assert_eq!(Value::from(Some("USD")), Value::String("USD".into()));
    let no_user: Option<&str> = None;
    assert!(Value::from(no_user).is_null());
}

#[test]
fn test_value_kinds_match_sink_columns() {
    let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    assert_eq!(Value::from(ts), Value::DateTimeTz(ts));
    assert_eq!(Value::from(9_000_000_000_i64), Value::Int64(9_000_000_000));
    assert_eq!(
        Value::from(Decimal::new(50_000_000, 2)).as_decimal(),
        Some(Decimal::new(50_000_000, 2))
    );
    assert_eq!(Value::from(String::from("evt-1")).as_str(), Some("evt-1"));
    assert_eq!(Value::Int64(3).as_decimal(), None);
}

#[test]
fn test_table_primary_key_order() {
    let table = TableMetadata::new("kpi_1m")
        .with_column(ColumnMetadata::new("revenue", "NUMERIC"))
        .with_column(ColumnMetadata::new("window_end", "TIMESTAMPTZ").primary_key(2))
        .with_column(ColumnMetadata::new("window_start", "TIMESTAMPTZ").primary_key(1));

    assert_eq!(table.primary_key(), vec!["window_start", "window_end"]);
    assert_eq!(
        table.column_names(),
        vec!["revenue", "window_end", "window_start"]
    );
    assert_eq!(table.qualified_name(), "kpi_1m");
    assert!(!table.columns[1].nullable);
}
