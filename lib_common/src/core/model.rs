//! # Relay Data Model
//!
//! Types shared by the connector, the subscription registry and the client sessions,
//! together with the JSON shapes they take on the client-facing socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a connected downstream client, unique for the lifetime of a relay.
pub type ClientId = u64;

/// Exchange product identifier, e.g. `BTC-USD`.
pub type ProductId = String;

/// Lifecycle of the single upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted. Requires an external restart.
    Failed,
    /// Stopped on request.
    Closed,
}

impl ConnectionState {
    /// `Failed` and `Closed` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

/// Whether anybody is currently listening to a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Available,
    Subscribed,
}

/// Per-product summary broadcast to every client. Derived from the registry, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub product_id: ProductId,
    pub display_name: String,
    pub state: ChannelState,
    pub subscriber_count: usize,
    pub last_update: DateTime<Utc>,
}

/// Latest best bid / best ask for a product. A new tick replaces the previous one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTick {
    pub product_id: ProductId,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// A single trade print from the `matches` channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    pub product_id: ProductId,
    #[serde(rename = "id")]
    pub trade_id: String,
    pub price: f64,
    pub size: f64,
    pub side: TradeSide,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub status: ConnectionState,
    pub timestamp: DateTime<Utc>,
}

impl ServiceStatus {
    pub fn now(status: ConnectionState) -> Self {
        Self { status, timestamp: Utc::now() }
    }
}

/// Error taxonomy reported by the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport-level failure talking to the exchange.
    ConnectionError,
    /// Frame could not be decoded as JSON.
    ParseError,
    /// Frame decoded but a required field is missing or malformed.
    ValidationError,
    /// A subscribe request could not be issued.
    SubscriptionError,
    /// Reconnect attempts exhausted; the connector is now `failed`.
    MaxReconnectError,
    /// `error` frame reported by the exchange itself.
    UpstreamError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    pub details: Value,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, details: impl Into<Value>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: details.into(),
        }
    }
}

/// Everything the upstream connector emits, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Status(ServiceStatus),
    PriceUpdate(PriceTick),
    Trade(TradeEvent),
    Error(ServiceError),
}

/// Frames sent to a downstream client: `{"event": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    PriceUpdate(PriceTick),
    Trade(TradeEvent),
    ChannelUpdate(Vec<ChannelStatus>),
    ServiceStatus(ServiceStatus),
    ServiceError(ServiceError),
    /// Scoped to one session, e.g. a request without a usable product id.
    Error { message: String },
}

/// Frames received from a downstream client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientRequest {
    Subscribe(ProductRequest),
    Unsubscribe(ProductRequest),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRequest {
    #[serde(default)]
    pub product_id: Option<String>,
}
