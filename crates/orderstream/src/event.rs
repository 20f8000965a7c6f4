//! Typed order and payment lifecycle events.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle step an event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    OrderCreated,
    PaymentInitiated,
    PaymentSuccess,
    PaymentFailed,
    OrderCancelled,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        Self::OrderCreated,
        Self::PaymentInitiated,
        Self::PaymentSuccess,
        Self::PaymentFailed,
        Self::OrderCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderCreated => "order_created",
            Self::PaymentInitiated => "payment_initiated",
            Self::PaymentSuccess => "payment_success",
            Self::PaymentFailed => "payment_failed",
            Self::OrderCancelled => "order_cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Vnd,
    Usd,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vnd => "VND",
            Self::Usd => "USD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VND" => Some(Self::Vnd),
            "USD" => Some(Self::Usd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Success,
    Pending,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "pending" => Some(Self::Pending),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A validated event.
///
/// Only [`SchemaValidator`](crate::validate::SchemaValidator) builds these from
/// broker payloads, so `id` and `order_id` are non-empty and `amount` is never
/// negative.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub event_time: DateTime<Utc>,
    pub event_type: EventType,
    pub order_id: String,
    pub user_id: Option<String>,
    pub amount: Decimal,
    pub currency: Option<Currency>,
    pub status: Option<PaymentStatus>,
}

impl Event {
    /// Render the broker payload for this event.
    ///
    /// Field names are camelCase, the timestamp carries microseconds and
    /// `amount` is a JSON number.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "eventTime": self.event_time.to_rfc3339_opts(SecondsFormat::Micros, true),
            "eventType": self.event_type.as_str(),
            "orderId": self.order_id,
            "userId": self.user_id,
            "amount": self.amount.to_f64().unwrap_or_default(),
            "currency": self.currency.map(|c| c.as_str()),
            "status": self.status.map(|s| s.as_str()),
        })
    }

    /// Record key the producer partitions on, so one order stays on one partition.
    pub fn partition_key(&self) -> &str {
        &self.order_id
    }
}

/// An admitted event as written to `events_clean`
#[derive(Debug, Clone, PartialEq)]
pub struct CleanEvent {
    pub event: Event,
    /// Wall-clock time the engine processed the record
    pub ingest_time: DateTime<Utc>,
}

impl CleanEvent {
    pub fn new(event: Event, ingest_time: DateTime<Utc>) -> Self {
        Self { event, ingest_time }
    }

    pub fn id(&self) -> &str {
        &self.event.id
    }
}
