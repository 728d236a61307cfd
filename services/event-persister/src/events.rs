//! Event definitions for the Event Persister
//!
//! `RawRecord` is what the broker client hands to the service; `DomainEvent`
//! is what the codec produces and the sink writes. Order and match events
//! share the same envelope (event_id, symbol, timestamp) so the sink can key
//! idempotent writes on `event_id` regardless of the stream.

use bytes::Bytes;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Partition number within a topic.
pub type Partition = i32;

/// Partition-local record position.
pub type Offset = i64;

/// A record as delivered by the broker, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub partition: Partition,
    pub offset: Offset,
    pub key: Bytes,
    pub value: Bytes,
    /// Broker append time, Unix nanoseconds
    pub timestamp: i64,
}

impl RawRecord {
    pub fn new(partition: Partition, offset: Offset, value: impl Into<Bytes>) -> Self {
        Self {
            partition,
            offset,
            key: Bytes::new(),
            value: value.into(),
            timestamp: 0,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Which event stream a runner consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Orders,
    Matches,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Orders => "orders",
            StreamKind::Matches => "matches",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    BUY,
    SELL,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Order status as reported by the matching engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// An order lifecycle event from the orders stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub event_id: String,
    pub symbol: String,
    /// Unix nanoseconds from the exchange clock
    pub timestamp: i64,
    pub order_id: String,
    pub account_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    /// Absent for market orders
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
}

/// A maker/taker match from the matches stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEvent {
    pub event_id: String,
    pub symbol: String,
    /// Unix nanoseconds from the exchange clock
    pub timestamp: i64,
    pub match_id: String,
    pub maker_order_id: String,
    pub taker_order_id: String,
    /// Side from taker perspective
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
}

impl MatchEvent {
    /// Notional value (price × quantity)
    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }
}

/// A decoded event from either stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum DomainEvent {
    Order(OrderEvent),
    Match(MatchEvent),
}

impl DomainEvent {
    pub fn event_id(&self) -> &str {
        match self {
            DomainEvent::Order(e) => &e.event_id,
            DomainEvent::Match(e) => &e.event_id,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            DomainEvent::Order(e) => &e.symbol,
            DomainEvent::Match(e) => &e.symbol,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            DomainEvent::Order(e) => e.timestamp,
            DomainEvent::Match(e) => e.timestamp,
        }
    }

    pub fn stream(&self) -> StreamKind {
        match self {
            DomainEvent::Order(_) => StreamKind::Orders,
            DomainEvent::Match(_) => StreamKind::Matches,
        }
    }

    /// Get the event type as a string label for logging.
    pub fn event_type_label(&self) -> &'static str {
        match self {
            DomainEvent::Order(_) => "Order",
            DomainEvent::Match(_) => "Match",
        }
    }
}

impl From<OrderEvent> for DomainEvent {
    fn from(event: OrderEvent) -> Self {
        DomainEvent::Order(event)
    }
}

impl From<MatchEvent> for DomainEvent {
    fn from(event: MatchEvent) -> Self {
        DomainEvent::Match(event)
    }
}
