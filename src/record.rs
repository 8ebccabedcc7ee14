// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The order/payment record and its wire codec.
//!
//! One [`OrderPaymentRecord`] is one row of `orders LEFT JOIN payments`. On the
//! topic it travels as UTF-8 JSON with camelCase field names, keyed by the
//! order id as a decimal string.
//!
//! ```json
//! {
//!   "orderId": 1, "customerId": 7, "orderDate": "2024-03-01T10:00:00",
//!   "totalAmount": 99.95, "orderState": "PAID",
//!   "paymentId": 10, "paymentDate": "2024-03-01T10:05:00",
//!   "paymentAmount": 99.95, "paymentMethod": "CARD", "paymentState": "SETTLED"
//! }
//! ```
//!
//! PascalCase names (`OrderId`, `PaymentState`, ...) are accepted on decode.

use crate::error::{ReplicationError, Result};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One order with its optional payment.
///
/// The payment columns are either all `None` (no payment yet) or
/// `payment_id` is set and the rest are individually nullable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OrderPaymentRecord {
    #[serde(alias = "OrderId")]
    pub order_id: i64,
    #[serde(alias = "CustomerId")]
    pub customer_id: i32,
    #[serde(alias = "OrderDate", with = "wire_time")]
    pub order_date: NaiveDateTime,
    #[serde(alias = "TotalAmount", with = "rust_decimal::serde::float")]
    pub total_amount: Decimal,
    #[serde(alias = "OrderState")]
    pub order_state: String,

    #[serde(default, alias = "PaymentId")]
    pub payment_id: Option<i64>,
    #[serde(default, alias = "PaymentDate", with = "wire_time::option")]
    pub payment_date: Option<NaiveDateTime>,
    #[serde(
        default,
        alias = "PaymentAmount",
        with = "rust_decimal::serde::float_option"
    )]
    pub payment_amount: Option<Decimal>,
    #[serde(default, alias = "PaymentMethod")]
    pub payment_method: Option<String>,
    #[serde(default, alias = "PaymentState")]
    pub payment_state: Option<String>,
}

/// Borrowed view of the payment columns of a record that has a payment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaymentFacet<'a> {
    pub payment_id: i64,
    pub order_id: i64,
    pub payment_date: Option<NaiveDateTime>,
    pub payment_amount: Option<Decimal>,
    pub payment_method: Option<&'a str>,
    pub payment_state: Option<&'a str>,
}

impl OrderPaymentRecord {
    /// The payment side, if this order has one.
    pub fn payment(&self) -> Option<PaymentFacet<'_>> {
        self.payment_id.map(|payment_id| PaymentFacet {
            payment_id,
            order_id: self.order_id,
            payment_date: self.payment_date,
            payment_amount: self.payment_amount,
            payment_method: self.payment_method.as_deref(),
            payment_state: self.payment_state.as_deref(),
        })
    }

    /// Payment columns set without a payment id.
    fn has_orphan_payment_fields(&self) -> bool {
        self.payment_id.is_none()
            && (self.payment_date.is_some()
                || self.payment_amount.is_some()
                || self.payment_method.is_some()
                || self.payment_state.is_some())
    }

    /// Create a paid, settled record for testing. Payment id is `order_id * 10`.
    pub fn for_testing(order_id: i64) -> Self {
        let order_date = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(10, 0, 0))
            .unwrap_or_default();
        Self {
            order_id,
            customer_id: (order_id % 1000) as i32,
            order_date,
            total_amount: Decimal::new(order_id * 100 + 99, 2),
            order_state: "PAID".to_string(),
            payment_id: Some(order_id * 10),
            payment_date: Some(order_date + chrono::Duration::minutes(5)),
            payment_amount: Some(Decimal::new(order_id * 100 + 99, 2)),
            payment_method: Some("CARD".to_string()),
            payment_state: Some("SETTLED".to_string()),
        }
    }

    /// Same as [`for_testing`](Self::for_testing) but without a payment.
    pub fn for_testing_unpaid(order_id: i64) -> Self {
        Self {
            order_state: "PENDING".to_string(),
            payment_id: None,
            payment_date: None,
            payment_amount: None,
            payment_method: None,
            payment_state: None,
            ..Self::for_testing(order_id)
        }
    }
}

/// Result of decoding one message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Record(OrderPaymentRecord),
    /// Empty or whitespace-only payload; nothing to replicate.
    Skip,
}

/// JSON codec for the topic payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordCodec;

impl RecordCodec {
    pub fn encode(record: &OrderPaymentRecord) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(record)?)
    }

    /// Decode a payload. Empty/whitespace payloads are [`Decoded::Skip`],
    /// anything else that is not a valid record is a codec error.
    pub fn decode(payload: &[u8]) -> Result<Decoded> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(Decoded::Skip);
        }
        let text = std::str::from_utf8(payload)
            .map_err(|e| ReplicationError::Codec(format!("payload is not UTF-8: {}", e)))?;
        if text.trim().is_empty() {
            return Ok(Decoded::Skip);
        }

        let record: OrderPaymentRecord = serde_json::from_str(text)?;
        if record.has_orphan_payment_fields() {
            return Err(ReplicationError::Codec(format!(
                "order {} has payment fields but no paymentId",
                record.order_id
            )));
        }
        Ok(Decoded::Record(record))
    }

    /// Message key: the order id as a decimal string.
    pub fn key(record: &OrderPaymentRecord) -> String {
        record.order_id.to_string()
    }
}

/// Timestamps are naive on the wire. Offset-qualified values (`...Z`,
/// `+01:00`) are accepted and converted to UTC.
mod wire_time {
    use chrono::{DateTime, NaiveDateTime};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub fn parse(raw: &str) -> Result<NaiveDateTime, String> {
        NaiveDateTime::parse_from_str(raw, FORMAT)
            .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.naive_utc()))
            .map_err(|e| format!("invalid timestamp {:?}: {}", raw, e))
    }

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<NaiveDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.collect_str(&v.format(FORMAT)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<NaiveDateTime>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => parse(&raw).map(Some).map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
