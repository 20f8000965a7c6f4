//! Schema validation for raw broker payloads
//!
//! Every record ends up either as a typed [`Event`] or as a
//! [`RejectionReason`]. Nothing here panics or returns an engine error, so one
//! bad record can never stall a partition.
//!
//! Rules:
//! - `id`, `eventTime`, `eventType` and `orderId` must be present and non-empty
//! - `amount` must be present, numeric and `>= 0`
//! - `eventTime` is tried against the strict microsecond pattern first, then
//!   generic ISO-8601 forms
//! - `userId`, `currency` and `status` are optional, but a present
//!   `currency`/`status` must be a known value

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;
use thiserror::Error;

use crate::event::{Currency, Event, EventType, PaymentStatus};
use crate::source::RawRecord;

/// Pattern producers are expected to use: `2024-05-01T12:00:30.123456Z`
const STRICT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Years accepted in `eventTime`; chrono's `%Y` takes signed six-digit
/// years whose window bounds would not be representable.
const YEAR_RANGE: std::ops::RangeInclusive<i32> = 1..=9999;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// Whether a rejection came from decoding or from a field rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    Parse,
    Validation,
}

impl RejectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Validation => "validation",
        }
    }
}

/// Why a record was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    #[error("record has no payload")]
    EmptyPayload,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` has invalid value {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("unparseable eventTime {0:?}")]
    UnparseableTimestamp(String),

    #[error("negative amount {0}")]
    NegativeAmount(Decimal),
}

impl RejectionReason {
    pub fn kind(&self) -> RejectionKind {
        match self {
            Self::EmptyPayload | Self::Malformed(_) | Self::UnparseableTimestamp(_) => {
                RejectionKind::Parse
            }
            Self::MissingField(_) | Self::InvalidValue { .. } | Self::NegativeAmount(_) => {
                RejectionKind::Validation
            }
        }
    }

    fn invalid(field: &'static str, value: &Value) -> Self {
        Self::InvalidValue {
            field,
            value: value.to_string(),
        }
    }
}

/// Parses broker payloads into typed events
#[derive(Debug, Clone, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, record: &RawRecord) -> Result<Event, RejectionReason> {
        match record.payload.as_deref() {
            Some(bytes) if !bytes.is_empty() => self.validate_payload(bytes),
            _ => Err(RejectionReason::EmptyPayload),
        }
    }

    pub fn validate_payload(&self, bytes: &[u8]) -> Result<Event, RejectionReason> {
        let root: Value = serde_json::from_slice(bytes)
            .map_err(|e| RejectionReason::Malformed(e.to_string()))?;
        let obj = root
            .as_object()
            .ok_or_else(|| RejectionReason::Malformed("expected a JSON object".into()))?;

        let id = required_str(obj, "id")?;
        let raw_time = required_str(obj, "eventTime")?;
        let raw_type = required_str(obj, "eventType")?;
        let order_id = required_str(obj, "orderId")?;
        let amount = amount(obj)?;

        let event_type = EventType::parse(raw_type).ok_or_else(|| RejectionReason::InvalidValue {
            field: "eventType",
            value: raw_type.to_string(),
        })?;

        let currency = optional_str(obj, "currency")?
            .map(|c| {
                Currency::parse(c).ok_or_else(|| RejectionReason::InvalidValue {
                    field: "currency",
                    value: c.to_string(),
                })
            })
            .transpose()?;

        let status = optional_str(obj, "status")?
            .map(|s| {
                PaymentStatus::parse(s).ok_or_else(|| RejectionReason::InvalidValue {
                    field: "status",
                    value: s.to_string(),
                })
            })
            .transpose()?;

        let event_time = parse_event_time(raw_time)
            .ok_or_else(|| RejectionReason::UnparseableTimestamp(raw_time.to_string()))?;

        Ok(Event {
            id: id.to_string(),
            event_time,
            event_type,
            order_id: order_id.to_string(),
            user_id: optional_str(obj, "userId")?.map(str::to_string),
            amount,
            currency,
            status,
        })
    }
}

fn required_str<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, RejectionReason> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(RejectionReason::MissingField(field)),
        Some(Value::String(s)) if s.trim().is_empty() => Err(RejectionReason::MissingField(field)),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(other) => Err(RejectionReason::invalid(field, other)),
    }
}

fn optional_str<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, RejectionReason> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(RejectionReason::invalid(field, other)),
    }
}

fn amount(obj: &Map<String, Value>) -> Result<Decimal, RejectionReason> {
    let value = match obj.get("amount") {
        None | Some(Value::Null) => return Err(RejectionReason::MissingField("amount")),
        Some(v) => v,
    };

    let text = match value {
        Value::Number(n) => n.to_string(),
        other => return Err(RejectionReason::invalid("amount", other)),
    };
    let amount = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| RejectionReason::invalid("amount", value))?;

    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(RejectionReason::NegativeAmount(amount));
    }
    Ok(amount)
}

/// Parse a producer timestamp.
///
/// The strict microsecond pattern is tried first, then RFC 3339 with any
/// offset, then zone-less ISO forms (read as UTC), then a bare date. Years
/// outside 1..=9999 are refused.
pub fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    parse_any(raw.trim()).filter(|t| YEAR_RANGE.contains(&t.year()))
}

fn parse_any(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, STRICT_FORMAT) {
        return Some(naive.and_utc());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(naive) = NAIVE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
    {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use serde_json::json;

    fn payload(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    fn valid() -> Value {
        json!({
            "id": "evt-1",
            "eventTime": "2024-05-01T12:00:30.123456Z",
            "eventType": "order_created",
            "orderId": "ORD-1",
            "userId": "USR-1",
            "amount": 100,
            "currency": "VND",
            "status": "pending"
        })
    }

    fn check(value: Value) -> Result<Event, RejectionReason> {
        SchemaValidator::new().validate_payload(&payload(value))
    }

    #[test]
    fn test_valid_event() {
        let event = check(valid()).unwrap();
        assert_eq!(event.id, "evt-1");
        assert_eq!(event.event_type, EventType::OrderCreated);
        assert_eq!(event.amount, Decimal::from(100));
        assert_eq!(event.currency, Some(Currency::Vnd));
        assert_eq!(event.status, Some(PaymentStatus::Pending));
        assert_eq!(event.event_time.nanosecond(), 123_456_000);
    }

    #[test]
    fn test_missing_required_fields_rejected() {
        for field in ["id", "eventTime", "eventType", "orderId", "amount"] {
            let mut value = valid();
            value.as_object_mut().unwrap().remove(field);
            assert_eq!(check(value), Err(RejectionReason::MissingField(field)));
        }
    }

    #[test]
    fn test_null_and_empty_fields_rejected() {
        let mut value = valid();
        value["orderId"] = Value::Null;
        assert_eq!(check(value), Err(RejectionReason::MissingField("orderId")));

        let mut value = valid();
        value["id"] = json!("   ");
        assert_eq!(check(value), Err(RejectionReason::MissingField("id")));
    }

    #[test]
    fn test_negative_amount_rejected() {
        let mut value = valid();
        value["amount"] = json!(-0.01);
        let err = check(value).unwrap_err();
        assert_eq!(err, RejectionReason::NegativeAmount(Decimal::new(-1, 2)));
        assert_eq!(err.kind(), RejectionKind::Validation);
    }

    #[test]
    fn test_zero_amount_accepted() {
        let mut value = valid();
        value["amount"] = json!(0);
        assert_eq!(check(value).unwrap().amount, Decimal::ZERO);

        let mut value = valid();
        value["amount"] = json!(-0.0);
        assert!(check(value).is_ok());
    }

    #[test]
    fn test_fractional_and_exponent_amounts() {
        let mut value = valid();
        value["amount"] = json!(1234.56);
        assert_eq!(check(value).unwrap().amount, Decimal::new(123_456, 2));

        let mut value = valid();
        value["amount"] = json!(1.5e6);
        assert_eq!(check(value).unwrap().amount, Decimal::from(1_500_000));
    }

    #[test]
    fn test_string_amount_rejected() {
        let mut value = valid();
        value["amount"] = json!("100");
        assert!(matches!(
            check(value),
            Err(RejectionReason::InvalidValue { field: "amount", .. })
        ));
    }

    #[test]
    fn test_unknown_enum_values_rejected() {
        let mut value = valid();
        value["eventType"] = json!("refund_issued");
        assert!(matches!(
            check(value),
            Err(RejectionReason::InvalidValue { field: "eventType", .. })
        ));

        let mut value = valid();
        value["currency"] = json!("EUR");
        assert!(matches!(
            check(value),
            Err(RejectionReason::InvalidValue { field: "currency", .. })
        ));
    }

    #[test]
    fn test_optional_fields_may_be_absent() {
        let mut value = valid();
        let obj = value.as_object_mut().unwrap();
        obj.remove("userId");
        obj.remove("currency");
        obj.remove("status");

        let event = check(value).unwrap();
        assert_eq!(event.user_id, None);
        assert_eq!(event.currency, None);
        assert_eq!(event.status, None);
    }

    #[test]
    fn test_malformed_payloads_are_parse_rejections() {
        let validator = SchemaValidator::new();

        let err = validator.validate_payload(b"{not json").unwrap_err();
        assert_eq!(err.kind(), RejectionKind::Parse);

        let err = validator.validate_payload(b"[1,2,3]").unwrap_err();
        assert!(matches!(err, RejectionReason::Malformed(_)));

        let record = RawRecord {
            partition: 0,
            offset: 7,
            key: None,
            payload: None,
            timestamp: None,
        };
        assert_eq!(validator.validate(&record), Err(RejectionReason::EmptyPayload));
    }

    #[test]
    fn test_unparseable_timestamp() {
        let mut value = valid();
        value["eventTime"] = json!("yesterday at noon");
        let err = check(value).unwrap_err();
        assert_eq!(
            err,
            RejectionReason::UnparseableTimestamp("yesterday at noon".into())
        );
        assert_eq!(err.kind(), RejectionKind::Parse);
    }

    #[test]
    fn test_out_of_range_years_rejected() {
        for raw in ["+262142-12-31T23:59:30", "+10000-01-01T00:00:00Z", "-0001-06-01T00:00:00"] {
            let mut value = valid();
            value["eventTime"] = json!(raw);
            assert_eq!(
                check(value).unwrap_err(),
                RejectionReason::UnparseableTimestamp(raw.into())
            );
        }
        assert!(parse_event_time("9999-12-31T23:59:59Z").is_some());
        assert!(parse_event_time("0001-01-01T00:00:00Z").is_some());
    }

    #[test]
    fn test_timestamp_fallbacks() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap();

        assert_eq!(
            parse_event_time("2024-05-01T12:00:30.000000Z"),
            Some(expected)
        );
        assert_eq!(parse_event_time("2024-05-01T12:00:30Z"), Some(expected));
        assert_eq!(
            parse_event_time("2024-05-01T19:00:30+07:00"),
            Some(expected)
        );
        assert_eq!(parse_event_time("2024-05-01T12:00:30"), Some(expected));
        assert_eq!(parse_event_time("2024-05-01 12:00:30.000"), Some(expected));
        assert_eq!(
            parse_event_time("2024-05-01"),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_event_time("2024-13-01T00:00:00Z"), None);
    }
}
