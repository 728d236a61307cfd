//! Event codec: raw broker payloads into typed domain events
//!
//! Payloads are JSON objects, one event per record. Decoding is pure; a
//! record that fails here is skipped by the runner and never retried, since
//! malformed data does not become valid on redelivery.
//!
//! Two failure classes are distinguished:
//! - `Decode`: the bytes are not the expected shape (bad JSON, wrong types,
//!   unknown enum values)
//! - `Validation`: the shape is right but a required field is absent or out
//!   of range

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::events::{
    DomainEvent, MatchEvent, Offset, OrderEvent, OrderStatus, OrderType, Partition, RawRecord,
    Side, StreamKind,
};

/// Per-record decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("undecodable payload at {partition}:{offset}: {reason}")]
    Decode {
        partition: Partition,
        offset: Offset,
        reason: String,
    },

    #[error("invalid event at {partition}:{offset}: `{field}` {reason}")]
    Validation {
        partition: Partition,
        offset: Offset,
        field: &'static str,
        reason: String,
    },
}

impl CodecError {
    /// Short label for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CodecError::Decode { .. } => "decode",
            CodecError::Validation { .. } => "validation",
        }
    }
}

/// Decodes records of one stream into domain events.
pub trait EventCodec: Send + Sync {
    fn stream(&self) -> StreamKind;

    fn decode(&self, record: &RawRecord) -> Result<DomainEvent, CodecError>;
}

/// Codec for the stream this runner consumes.
pub fn codec_for(stream: StreamKind) -> Box<dyn EventCodec> {
    match stream {
        StreamKind::Orders => Box::new(OrderCodec),
        StreamKind::Matches => Box::new(MatchCodec),
    }
}

#[derive(Debug, Deserialize)]
struct OrderPayload {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    side: Option<Side>,
    #[serde(default)]
    order_type: Option<OrderType>,
    #[serde(default)]
    status: Option<OrderStatus>,
    #[serde(default)]
    price: Option<Decimal>,
    #[serde(default)]
    quantity: Option<Decimal>,
    #[serde(default)]
    filled_quantity: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct MatchPayload {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    match_id: Option<String>,
    #[serde(default)]
    maker_order_id: Option<String>,
    #[serde(default)]
    taker_order_id: Option<String>,
    #[serde(default)]
    side: Option<Side>,
    #[serde(default)]
    price: Option<Decimal>,
    #[serde(default)]
    quantity: Option<Decimal>,
}

/// Decoder for the orders stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderCodec;

impl EventCodec for OrderCodec {
    fn stream(&self) -> StreamKind {
        StreamKind::Orders
    }

    fn decode(&self, record: &RawRecord) -> Result<DomainEvent, CodecError> {
        let payload: OrderPayload = parse(record)?;
        let check = Checker { record };

        let order_type = payload.order_type.unwrap_or(OrderType::Limit);
        let quantity = check.positive("quantity", payload.quantity)?;
        let filled_quantity = payload.filled_quantity.unwrap_or(Decimal::ZERO);
        if filled_quantity.is_sign_negative() {
            return Err(check.invalid("filled_quantity", "must not be negative"));
        }
        if filled_quantity > quantity {
            return Err(check.invalid(
                "filled_quantity",
                format!("{} exceeds quantity {}", filled_quantity, quantity),
            ));
        }
        let price = match (order_type, payload.price) {
            (OrderType::Limit, price) => Some(check.positive("price", price)?),
            (OrderType::Market, Some(price)) => Some(check.positive("price", Some(price))?),
            (OrderType::Market, None) => None,
        };

        Ok(DomainEvent::Order(OrderEvent {
            event_id: check.non_empty("event_id", payload.event_id)?,
            symbol: check.non_empty("symbol", payload.symbol)?,
            timestamp: check.timestamp(payload.timestamp)?,
            order_id: check.non_empty("order_id", payload.order_id)?,
            account_id: check.non_empty("account_id", payload.account_id)?,
            side: check.present("side", payload.side)?,
            order_type,
            status: check.present("status", payload.status)?,
            price,
            quantity,
            filled_quantity,
        }))
    }
}

/// Decoder for the matches stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchCodec;

impl EventCodec for MatchCodec {
    fn stream(&self) -> StreamKind {
        StreamKind::Matches
    }

    fn decode(&self, record: &RawRecord) -> Result<DomainEvent, CodecError> {
        let payload: MatchPayload = parse(record)?;
        let check = Checker { record };

        let maker_order_id = check.non_empty("maker_order_id", payload.maker_order_id)?;
        let taker_order_id = check.non_empty("taker_order_id", payload.taker_order_id)?;
        if maker_order_id == taker_order_id {
            return Err(check.invalid("taker_order_id", "equals maker_order_id"));
        }

        Ok(DomainEvent::Match(MatchEvent {
            event_id: check.non_empty("event_id", payload.event_id)?,
            symbol: check.non_empty("symbol", payload.symbol)?,
            timestamp: check.timestamp(payload.timestamp)?,
            match_id: check.non_empty("match_id", payload.match_id)?,
            maker_order_id,
            taker_order_id,
            side: check.present("side", payload.side)?,
            price: check.positive("price", payload.price)?,
            quantity: check.positive("quantity", payload.quantity)?,
        }))
    }
}

fn parse<T: DeserializeOwned>(record: &RawRecord) -> Result<T, CodecError> {
    serde_json::from_slice(&record.value).map_err(|e| CodecError::Decode {
        partition: record.partition,
        offset: record.offset,
        reason: e.to_string(),
    })
}

/// Field checks that report the failing record's position.
struct Checker<'a> {
    record: &'a RawRecord,
}

impl Checker<'_> {
    fn invalid(&self, field: &'static str, reason: impl Into<String>) -> CodecError {
        CodecError::Validation {
            partition: self.record.partition,
            offset: self.record.offset,
            field,
            reason: reason.into(),
        }
    }

    fn present<T>(&self, field: &'static str, value: Option<T>) -> Result<T, CodecError> {
        value.ok_or_else(|| self.invalid(field, "is missing"))
    }

    fn non_empty(&self, field: &'static str, value: Option<String>) -> Result<String, CodecError> {
        let value = self.present(field, value)?;
        if value.trim().is_empty() {
            return Err(self.invalid(field, "is empty"));
        }
        Ok(value)
    }

    fn positive(&self, field: &'static str, value: Option<Decimal>) -> Result<Decimal, CodecError> {
        let value = self.present(field, value)?;
        if value <= Decimal::ZERO {
            return Err(self.invalid(field, format!("must be positive, got {}", value)));
        }
        Ok(value)
    }

    fn timestamp(&self, value: Option<i64>) -> Result<i64, CodecError> {
        let value = self.present("timestamp", value)?;
        if value <= 0 {
            return Err(self.invalid("timestamp", format!("must be positive, got {}", value)));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    fn record(value: serde_json::Value) -> RawRecord {
        RawRecord::new(0, 7, serde_json::to_vec(&value).unwrap())
    }

    fn order_json() -> serde_json::Value {
        json!({
            "event_id": "evt-1",
            "symbol": "BTC/USDT",
            "timestamp": 1708123456789000000i64,
            "order_id": "ord-1",
            "account_id": "acc-1",
            "side": "BUY",
            "order_type": "LIMIT",
            "status": "NEW",
            "price": "50000.25",
            "quantity": "1.5",
        })
    }

    fn match_json() -> serde_json::Value {
        json!({
            "event_id": "evt-9",
            "symbol": "ETH/USDC",
            "timestamp": 1708123456789000000i64,
            "match_id": "m-9",
            "maker_order_id": "ord-1",
            "taker_order_id": "ord-2",
            "side": "SELL",
            "price": "3100",
            "quantity": 2,
        })
    }

    fn assert_validation(result: Result<DomainEvent, CodecError>, expected_field: &str) {
        match result {
            Err(CodecError::Validation { field, offset, .. }) => {
                assert_eq!(field, expected_field);
                assert_eq!(offset, 7);
            }
            other => panic!("Expected Validation on {}, got {:?}", expected_field, other),
        }
    }

    #[test]
    fn test_decode_order() {
        let event = OrderCodec.decode(&record(order_json())).unwrap();
        match event {
            DomainEvent::Order(order) => {
                assert_eq!(order.event_id, "evt-1");
                assert_eq!(order.side, Side::BUY);
                assert_eq!(order.status, OrderStatus::New);
                assert_eq!(order.price, Some(Decimal::from_str("50000.25").unwrap()));
                assert_eq!(order.filled_quantity, Decimal::ZERO);
            }
            other => panic!("Expected Order, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_market_order_without_price() {
        let mut value = order_json();
        value["order_type"] = json!("MARKET");
        value.as_object_mut().unwrap().remove("price");

        let event = OrderCodec.decode(&record(value)).unwrap();
        match event {
            DomainEvent::Order(order) => assert_eq!(order.price, None),
            other => panic!("Expected Order, got {:?}", other),
        }
    }

    #[test]
    fn test_limit_order_requires_price() {
        let mut value = order_json();
        value.as_object_mut().unwrap().remove("price");
        assert_validation(OrderCodec.decode(&record(value)), "price");
    }

    #[test]
    fn test_decode_match_accepts_numeric_decimals() {
        let event = MatchCodec.decode(&record(match_json())).unwrap();
        match event {
            DomainEvent::Match(m) => {
                assert_eq!(m.quantity, Decimal::from(2));
                assert_eq!(m.price, Decimal::from(3100));
            }
            other => panic!("Expected Match, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json_is_decode_error() {
        let raw = RawRecord::new(2, 11, &b"{not json"[..]);
        let err = OrderCodec.decode(&raw).unwrap_err();
        assert_eq!(err.kind(), "decode");
        assert!(matches!(err, CodecError::Decode { partition: 2, offset: 11, .. }));
    }

    #[test]
    fn test_unknown_side_is_decode_error() {
        let mut value = order_json();
        value["side"] = json!("SIDEWAYS");
        let err = OrderCodec.decode(&record(value)).unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn test_empty_symbol_rejected() {
        let mut value = order_json();
        value["symbol"] = json!("  ");
        assert_validation(OrderCodec.decode(&record(value)), "symbol");
    }

    #[test]
    fn test_missing_event_id_rejected() {
        let mut value = match_json();
        value.as_object_mut().unwrap().remove("event_id");
        assert_validation(MatchCodec.decode(&record(value)), "event_id");
    }

    #[test]
    fn test_non_positive_timestamp_rejected() {
        let mut value = order_json();
        value["timestamp"] = json!(0);
        assert_validation(OrderCodec.decode(&record(value.clone())), "timestamp");

        value["timestamp"] = json!(-5);
        assert_validation(OrderCodec.decode(&record(value)), "timestamp");
    }

    #[test]
    fn test_overfilled_order_rejected() {
        let mut value = order_json();
        value["filled_quantity"] = json!("2");
        assert_validation(OrderCodec.decode(&record(value)), "filled_quantity");
    }

    #[test]
    fn test_self_match_rejected() {
        let mut value = match_json();
        value["taker_order_id"] = json!("ord-1");
        assert_validation(MatchCodec.decode(&record(value)), "taker_order_id");
    }

    #[test]
    fn test_zero_quantity_match_rejected() {
        let mut value = match_json();
        value["quantity"] = json!("0");
        assert_validation(MatchCodec.decode(&record(value)), "quantity");
    }

    #[test]
    fn test_codec_for_stream() {
        assert_eq!(codec_for(StreamKind::Orders).stream(), StreamKind::Orders);
        assert_eq!(codec_for(StreamKind::Matches).stream(), StreamKind::Matches);

        // An order payload is not a valid match
        let result = codec_for(StreamKind::Matches).decode(&record(order_json()));
        assert!(result.is_err());
    }
}
